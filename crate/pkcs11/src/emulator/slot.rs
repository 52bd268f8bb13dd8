//! Disk-backed slot: every object is an `.info`/`.value` file pair under the
//! slot directory, private and secret values wrapped by the key cryptor.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use openssl::{
    bn::{BigNum, BigNumContext},
    dsa::Dsa,
    ec::{Asn1Flag, EcGroup, EcKey, PointConversionForm},
    hash::{hash, MessageDigest},
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
};
use rand::{rngs::OsRng, TryRngCore};
use tracing::info;

use crate::{
    asn1, curves,
    conf::{P11MechanismFilter, P11NewObjectConf},
    emulator::{cryptor::KeyCryptor, sign},
    error::{TokenError, TokenResult},
    key::P11Key,
    names::{
        self, CKF_DIGEST, CKF_GENERATE, CKF_GENERATE_KEY_PAIR, CKF_SIGN, CKF_VERIFY,
        CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY,
    },
    params::{ExtraParams, P11Params},
    slot::{
        stable_hash32, KeyId, MechanismInfo, NewKeyControl, P11Slot, SlotCore, SlotId, ED25519_OID,
        ED448_OID, X25519_OID, X448_OID,
    },
};

pub(super) const FILE_SLOT_INFO: &str = "slot.info";
pub(super) const PROP_NAMED_CURVE_SUPPORTED: &str = "namedCurveSupported";

const DIR_PRIV_KEY: &str = "privkey";
const DIR_PUB_KEY: &str = "pubkey";
const DIR_SEC_KEY: &str = "seckey";
const INFO_FILE_SUFFIX: &str = ".info";
const VALUE_FILE_SUFFIX: &str = ".value";

const PROP_ID: &str = "id";
const PROP_LABEL: &str = "label";
const PROP_SHA1SUM: &str = "sha1";
const PROP_ALGO: &str = "algo";
const PROP_KEYTYPE: &str = "keytype";
const PROP_ALGORITHM: &str = "algorithm";
const PROP_KEYSPEC: &str = "keyspec";

// RSA
const PROP_RSA_MODUS: &str = "modus";
const PROP_RSA_PUBLIC_EXPONENT: &str = "publicExponent";

// DSA
const PROP_DSA_PRIME: &str = "prime"; // p
const PROP_DSA_SUBPRIME: &str = "subprime"; // q
const PROP_DSA_BASE: &str = "base"; // g
const PROP_DSA_VALUE: &str = "value"; // y

// EC
const PROP_EC_PARAMS: &str = "ecParams";
const PROP_EC_POINT: &str = "ecPoint";

const OID_RSA: &str = "1.2.840.113549.1.1.1";
const OID_DSA: &str = "1.2.840.10040.4.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";

/// Properties of one `.info` file, insertion-ordered.
type Props = Vec<(String, String)>;

fn prop<'a>(props: &'a Props, key: &str) -> Option<&'a str> {
    props
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn required_prop<'a>(props: &'a Props, key: &str, file: &Path) -> TokenResult<&'a str> {
    prop(props, key).ok_or_else(|| {
        TokenError::Default(format!("missing property '{key}' in {}", file.display()))
    })
}

fn hex_prop(props: &Props, key: &str, file: &Path) -> TokenResult<Vec<u8>> {
    hex::decode(required_prop(props, key, file)?).map_err(|e| {
        TokenError::Default(format!("invalid hex property '{key}' in {}: {e}", file.display()))
    })
}

pub(super) fn load_props(file: &Path) -> TokenResult<Props> {
    let content = fs::read_to_string(file)?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect())
}

fn store_props(file: &Path, props: &Props) -> TokenResult<()> {
    let mut out = String::new();
    for (k, v) in props {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    fs::write(file, out)?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ObjKind {
    Private,
    Public,
    Secret,
}

impl ObjKind {
    fn object_class(self) -> u64 {
        match self {
            Self::Private => CKO_PRIVATE_KEY,
            Self::Public => CKO_PUBLIC_KEY,
            Self::Secret => CKO_SECRET_KEY,
        }
    }
}

/// The mechanisms the emulator implements in software.
fn supported_mechanisms() -> HashMap<u64, MechanismInfo> {
    let mut mechs = HashMap::new();
    let mut put = |codes: &[u64], flags: u64| {
        for &code in codes {
            mechs.insert(code, MechanismInfo::new(0, u64::MAX, flags));
        }
    };

    // keypair generation
    put(
        &[
            names::CKM_DSA_KEY_PAIR_GEN,
            names::CKM_RSA_X9_31_KEY_PAIR_GEN,
            names::CKM_RSA_PKCS_KEY_PAIR_GEN,
            names::CKM_EC_KEY_PAIR_GEN,
            names::CKM_EC_EDWARDS_KEY_PAIR_GEN,
            names::CKM_EC_MONTGOMERY_KEY_PAIR_GEN,
            names::CKM_VENDOR_SM2_KEY_PAIR_GEN,
        ],
        CKF_GENERATE_KEY_PAIR,
    );

    // secret key generation
    put(
        &[
            names::CKM_GENERIC_SECRET_KEY_GEN,
            names::CKM_AES_KEY_GEN,
            names::CKM_DES3_KEY_GEN,
        ],
        CKF_GENERATE,
    );

    // digests
    put(
        &[
            names::CKM_SHA_1,
            names::CKM_SHA224,
            names::CKM_SHA256,
            names::CKM_SHA384,
            names::CKM_SHA512,
            names::CKM_SHA3_224,
            names::CKM_SHA3_256,
            names::CKM_SHA3_384,
            names::CKM_SHA3_512,
        ],
        CKF_DIGEST,
    );

    // HMAC
    put(
        &[
            names::CKM_SHA_1_HMAC,
            names::CKM_SHA224_HMAC,
            names::CKM_SHA256_HMAC,
            names::CKM_SHA384_HMAC,
            names::CKM_SHA512_HMAC,
            names::CKM_SHA3_224_HMAC,
            names::CKM_SHA3_256_HMAC,
            names::CKM_SHA3_384_HMAC,
            names::CKM_SHA3_512_HMAC,
        ],
        CKF_SIGN | CKF_VERIFY,
    );

    // RSA
    put(
        &[names::CKM_RSA_X_509],
        names::CKF_ENCRYPT | names::CKF_DECRYPT | CKF_SIGN | CKF_VERIFY,
    );
    put(
        &[
            names::CKM_RSA_PKCS,
            names::CKM_SHA1_RSA_PKCS,
            names::CKM_SHA224_RSA_PKCS,
            names::CKM_SHA256_RSA_PKCS,
            names::CKM_SHA384_RSA_PKCS,
            names::CKM_SHA512_RSA_PKCS,
            names::CKM_SHA3_224_RSA_PKCS,
            names::CKM_SHA3_256_RSA_PKCS,
            names::CKM_SHA3_384_RSA_PKCS,
            names::CKM_SHA3_512_RSA_PKCS,
            names::CKM_RSA_PKCS_PSS,
            names::CKM_SHA1_RSA_PKCS_PSS,
            names::CKM_SHA224_RSA_PKCS_PSS,
            names::CKM_SHA256_RSA_PKCS_PSS,
            names::CKM_SHA384_RSA_PKCS_PSS,
            names::CKM_SHA512_RSA_PKCS_PSS,
            names::CKM_SHA3_224_RSA_PKCS_PSS,
            names::CKM_SHA3_256_RSA_PKCS_PSS,
            names::CKM_SHA3_384_RSA_PKCS_PSS,
            names::CKM_SHA3_512_RSA_PKCS_PSS,
        ],
        CKF_SIGN | CKF_VERIFY,
    );

    // DSA and ECDSA
    put(
        &[
            names::CKM_DSA,
            names::CKM_DSA_SHA1,
            names::CKM_DSA_SHA224,
            names::CKM_DSA_SHA256,
            names::CKM_DSA_SHA384,
            names::CKM_DSA_SHA512,
            names::CKM_DSA_SHA3_224,
            names::CKM_DSA_SHA3_256,
            names::CKM_DSA_SHA3_384,
            names::CKM_DSA_SHA3_512,
            names::CKM_ECDSA,
            names::CKM_ECDSA_SHA1,
            names::CKM_ECDSA_SHA224,
            names::CKM_ECDSA_SHA256,
            names::CKM_ECDSA_SHA384,
            names::CKM_ECDSA_SHA512,
            names::CKM_ECDSA_SHA3_224,
            names::CKM_ECDSA_SHA3_256,
            names::CKM_ECDSA_SHA3_384,
            names::CKM_ECDSA_SHA3_512,
        ],
        CKF_SIGN | CKF_VERIFY,
    );

    // EdDSA
    put(&[names::CKM_EDDSA], CKF_SIGN | CKF_VERIFY);

    mechs
}

pub struct EmulatorP11Slot {
    core: SlotCore,
    priv_key_dir: PathBuf,
    pub_key_dir: PathBuf,
    sec_key_dir: PathBuf,
    cryptor: KeyCryptor,
    named_curve_supported: bool,
}

impl EmulatorP11Slot {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        module_name: &str,
        slot_dir: &Path,
        slot_id: SlotId,
        read_only: bool,
        cryptor: KeyCryptor,
        mechanism_filter: &P11MechanismFilter,
        new_object_conf: P11NewObjectConf,
        secret_key_types: Option<Vec<u64>>,
        key_pair_types: Option<Vec<u64>>,
    ) -> TokenResult<Self> {
        let priv_key_dir = slot_dir.join(DIR_PRIV_KEY);
        let pub_key_dir = slot_dir.join(DIR_PUB_KEY);
        let sec_key_dir = slot_dir.join(DIR_SEC_KEY);
        for dir in [&priv_key_dir, &pub_key_dir, &sec_key_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let slot_info_file = slot_dir.join(FILE_SLOT_INFO);
        let named_curve_supported = if slot_info_file.exists() {
            let props = load_props(&slot_info_file)?;
            prop(&props, PROP_NAMED_CURVE_SUPPORTED) != Some("false")
        } else {
            true
        };

        let mut core = SlotCore::new(
            module_name,
            slot_id,
            read_only,
            secret_key_types,
            key_pair_types,
            new_object_conf,
        );
        core.init_mechanisms(supported_mechanisms(), mechanism_filter);

        Ok(Self {
            core,
            priv_key_dir,
            pub_key_dir,
            sec_key_dir,
            cryptor,
            named_curve_supported,
        })
    }

    fn dir(&self, kind: ObjKind) -> &Path {
        match kind {
            ObjKind::Private => &self.priv_key_dir,
            ObjKind::Public => &self.pub_key_dir,
            ObjKind::Secret => &self.sec_key_dir,
        }
    }

    fn info_file(&self, kind: ObjKind, hex_id: &str) -> PathBuf {
        self.dir(kind).join(format!("{hex_id}{INFO_FILE_SUFFIX}"))
    }

    fn value_file(&self, kind: ObjKind, hex_id: &str) -> PathBuf {
        self.dir(kind).join(format!("{hex_id}{VALUE_FILE_SUFFIX}"))
    }

    fn info_files(&self, kind: ObjKind) -> TokenResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.dir(kind))? {
            let path = entry?.path();
            if path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(INFO_FILE_SUFFIX))
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn id_from_info_filename(file: &Path) -> TokenResult<Vec<u8>> {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(INFO_FILE_SUFFIX))
            .ok_or_else(|| {
                TokenError::Default(format!("unexpected info file name {}", file.display()))
            })?;
        hex::decode(name).map_err(|e| {
            TokenError::Default(format!("invalid info file name {}: {e}", file.display()))
        })
    }

    fn handle_for_id(id: &[u8]) -> u64 {
        u64::from(stable_hash32(id)) << 8
    }

    fn files_for_label(&self, kind: ObjKind, label: &str) -> TokenResult<Vec<PathBuf>> {
        let mut matching = Vec::new();
        for file in self.info_files(kind)? {
            let props = load_props(&file)?;
            if prop(&props, PROP_LABEL) == Some(label) {
                matching.push(file);
            }
        }
        Ok(matching)
    }

    fn find_info_by_handle(&self, handle: u64) -> TokenResult<Option<(ObjKind, Vec<u8>, PathBuf)>> {
        let (kinds, hash): (&[ObjKind], u32) = if handle & 0xFF == 1 {
            (&[ObjKind::Public], (handle >> 8) as u32)
        } else {
            (&[ObjKind::Private, ObjKind::Secret], (handle >> 8) as u32)
        };
        for &kind in kinds {
            for file in self.info_files(kind)? {
                let id = Self::id_from_info_filename(&file)?;
                if stable_hash32(&id) == hash {
                    return Ok(Some((kind, id, file)));
                }
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // storage
    // ------------------------------------------------------------------

    fn save_entry(
        &self,
        kind: ObjKind,
        id: &[u8],
        label: &str,
        key_type: u64,
        algo: &str,
        keyspec: Option<&str>,
        encrypted_value: &[u8],
    ) -> TokenResult<KeyId> {
        let hex_id = hex::encode(id);
        let mut props: Props = vec![
            (PROP_ID.to_string(), hex_id.clone()),
            (PROP_LABEL.to_string(), label.to_string()),
            (PROP_KEYTYPE.to_string(), key_type.to_string()),
            (PROP_ALGO.to_string(), algo.to_string()),
        ];
        if let Some(keyspec) = keyspec {
            props.push((PROP_KEYSPEC.to_string(), keyspec.to_string()));
        }
        let sha1 = hash(MessageDigest::sha1(), encrypted_value)
            .map_err(|e| TokenError::Default(format!("could not hash value: {e}")))?;
        props.push((PROP_SHA1SUM.to_string(), hex::encode(&*sha1)));

        store_props(&self.info_file(kind, &hex_id), &props)?;
        fs::write(self.value_file(kind, &hex_id), encrypted_value)?;

        Ok(KeyId::new(
            Self::handle_for_id(id),
            kind.object_class(),
            key_type,
            id.to_vec(),
            label.to_string(),
        ))
    }

    fn save_public_key(
        &self,
        id: &[u8],
        label: &str,
        key_type: u64,
        key: &PKey<Private>,
        keyspec: Option<&str>,
    ) -> TokenResult<u64> {
        let hex_id = hex::encode(id);
        let mut props: Props = vec![
            (PROP_ID.to_string(), hex_id.clone()),
            (PROP_LABEL.to_string(), label.to_string()),
            (PROP_KEYTYPE.to_string(), key_type.to_string()),
        ];
        if let Some(keyspec) = keyspec {
            props.push((PROP_KEYSPEC.to_string(), keyspec.to_string()));
        }

        match key.id() {
            Id::RSA => {
                let rsa = key.rsa().map_err(ssl_err)?;
                props.push((PROP_ALGORITHM.to_string(), OID_RSA.to_string()));
                props.push((PROP_RSA_MODUS.to_string(), hex::encode(rsa.n().to_vec())));
                props.push((
                    PROP_RSA_PUBLIC_EXPONENT.to_string(),
                    hex::encode(rsa.e().to_vec()),
                ));
            }
            Id::DSA => {
                let dsa = key.dsa().map_err(ssl_err)?;
                props.push((PROP_ALGORITHM.to_string(), OID_DSA.to_string()));
                props.push((PROP_DSA_PRIME.to_string(), hex::encode(dsa.p().to_vec())));
                props.push((PROP_DSA_SUBPRIME.to_string(), hex::encode(dsa.q().to_vec())));
                props.push((PROP_DSA_BASE.to_string(), hex::encode(dsa.g().to_vec())));
                props.push((
                    PROP_DSA_VALUE.to_string(),
                    hex::encode(dsa.pub_key().to_vec()),
                ));
            }
            Id::EC | Id::SM2 => {
                let ec = key.ec_key().map_err(ssl_err)?;
                props.push((PROP_ALGORITHM.to_string(), OID_EC_PUBLIC_KEY.to_string()));

                let nid = ec.group().curve_name().ok_or_else(|| {
                    TokenError::Default("EC public key is not on a named curve".to_string())
                })?;
                let curve = curves::by_nid(nid).ok_or_else(|| {
                    TokenError::Default(format!("unsupported curve {nid:?}"))
                })?;
                let ec_params = if self.named_curve_supported {
                    asn1::encode_oid(curve.oid)?
                } else {
                    // write the full parameters instead of the OID
                    explicit_ec_parameters(&ec)?
                };
                props.push((PROP_EC_PARAMS.to_string(), hex::encode(&ec_params)));

                let mut ctx = BigNumContext::new().map_err(ssl_err)?;
                let point = ec
                    .public_key()
                    .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
                    .map_err(ssl_err)?;
                props.push((
                    PROP_EC_POINT.to_string(),
                    hex::encode(asn1::wrap_octet_string(&point)),
                ));
            }
            Id::ED25519 | Id::ED448 | Id::X25519 | Id::X448 => {
                let curve_oid = match key.id() {
                    Id::ED25519 => ED25519_OID,
                    Id::ED448 => ED448_OID,
                    Id::X25519 => X25519_OID,
                    _ => X448_OID,
                };
                props.push((PROP_ALGORITHM.to_string(), curve_oid.to_string()));
                props.push((
                    PROP_EC_PARAMS.to_string(),
                    hex::encode(asn1::encode_oid(curve_oid)?),
                ));
                let raw = key.raw_public_key().map_err(ssl_err)?;
                props.push((PROP_EC_POINT.to_string(), hex::encode(&raw)));
            }
            other => {
                return Err(TokenError::Default(format!(
                    "unsupported public key type {other:?}"
                )))
            }
        }

        store_props(&self.info_file(ObjKind::Public, &hex_id), &props)?;
        Ok(Self::handle_for_id(id) + 1)
    }

    fn save_keypair(
        &self,
        key_type: u64,
        key: &PKey<Private>,
        control: &NewKeyControl,
        keyspec: Option<&str>,
    ) -> TokenResult<KeyId> {
        let id = control
            .id
            .as_deref()
            .ok_or_else(|| TokenError::Default("new-key control carries no id".to_string()))?;
        let label = &control.label;

        let public_key_handle = self.save_public_key(id, label, key_type, key, keyspec)?;
        let encrypted = self.cryptor.encrypt_private_key(key)?;
        let key_id = self.save_entry(
            ObjKind::Private,
            id,
            label,
            key_type,
            private_key_algo(key),
            keyspec,
            &encrypted,
        )?;
        Ok(key_id.with_public_key_handle(public_key_handle))
    }

    fn save_secret_key(
        &self,
        key_type: u64,
        key_value: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let id = control
            .id
            .as_deref()
            .ok_or_else(|| TokenError::Default("new-key control carries no id".to_string()))?;
        let encrypted = self.cryptor.encrypt(key_value)?;
        let keyspec = (key_value.len() * 8).to_string();
        self.save_entry(
            ObjKind::Secret,
            id,
            &control.label,
            key_type,
            secret_key_algo(key_type)?,
            Some(&keyspec),
            &encrypted,
        )
    }

    fn delete_entry(&self, kind: ObjKind, id: &[u8]) -> bool {
        let hex_id = hex::encode(id);
        let info = self.info_file(kind, &hex_id);
        let value = self.value_file(kind, &hex_id);
        let deleted_info = info.exists() && fs::remove_file(&info).is_ok();
        let deleted_value = value.exists() && fs::remove_file(&value).is_ok();
        deleted_info || deleted_value
    }

    fn delete_entries_by_id_label(
        &self,
        kind: ObjKind,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<usize> {
        match (id, label) {
            (Some(id), None) => Ok(usize::from(self.delete_entry(kind, id))),
            (Some(id), Some(label)) => {
                let info = self.info_file(kind, &hex::encode(id));
                if !info.exists() {
                    return Ok(0);
                }
                let props = load_props(&info)?;
                if prop(&props, PROP_LABEL) != Some(label) {
                    return Ok(0);
                }
                Ok(usize::from(self.delete_entry(kind, id)))
            }
            (None, Some(label)) => {
                let mut ids = Vec::new();
                for file in self.files_for_label(kind, label)? {
                    ids.push(Self::id_from_info_filename(&file)?);
                }
                for id in &ids {
                    self.delete_entry(kind, id);
                }
                Ok(ids.len())
            }
            (None, None) => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // reading
    // ------------------------------------------------------------------

    /// Reconstructs the DER SubjectPublicKeyInfo stored for `id`.
    fn read_public_key_spki(&self, id: &[u8]) -> TokenResult<Vec<u8>> {
        let file = self.info_file(ObjKind::Public, &hex::encode(id));
        let props = load_props(&file)?;
        let algorithm = required_prop(&props, PROP_ALGORITHM, &file)?;

        let pkey = match algorithm {
            OID_RSA => {
                let n = BigNum::from_slice(&hex_prop(&props, PROP_RSA_MODUS, &file)?)
                    .map_err(ssl_err)?;
                let e = BigNum::from_slice(&hex_prop(&props, PROP_RSA_PUBLIC_EXPONENT, &file)?)
                    .map_err(ssl_err)?;
                PKey::from_rsa(Rsa::from_public_components(n, e).map_err(ssl_err)?)
                    .map_err(ssl_err)?
            }
            OID_DSA => {
                let p = BigNum::from_slice(&hex_prop(&props, PROP_DSA_PRIME, &file)?)
                    .map_err(ssl_err)?;
                let q = BigNum::from_slice(&hex_prop(&props, PROP_DSA_SUBPRIME, &file)?)
                    .map_err(ssl_err)?;
                let g = BigNum::from_slice(&hex_prop(&props, PROP_DSA_BASE, &file)?)
                    .map_err(ssl_err)?;
                let y = BigNum::from_slice(&hex_prop(&props, PROP_DSA_VALUE, &file)?)
                    .map_err(ssl_err)?;
                PKey::from_dsa(Dsa::from_public_components(p, q, g, y).map_err(ssl_err)?)
                    .map_err(ssl_err)?
            }
            OID_EC_PUBLIC_KEY => {
                let curve = self.stored_curve(&props, &file)?;
                let group = EcGroup::from_curve_name(curve.nid).map_err(ssl_err)?;
                let point_der = hex_prop(&props, PROP_EC_POINT, &file)?;
                let point_bytes = asn1::unwrap_octet_string(&point_der)?;
                let mut ctx = BigNumContext::new().map_err(ssl_err)?;
                let point = openssl::ec::EcPoint::from_bytes(&group, &point_bytes, &mut ctx)
                    .map_err(ssl_err)?;
                let ec = EcKey::from_public_key(&group, &point).map_err(ssl_err)?;
                PKey::from_ec_key(ec).map_err(ssl_err)?
            }
            ED25519_OID | ED448_OID | X25519_OID | X448_OID => {
                let raw = hex_prop(&props, PROP_EC_POINT, &file)?;
                let key_id = match algorithm {
                    ED25519_OID => Id::ED25519,
                    ED448_OID => Id::ED448,
                    X25519_OID => Id::X25519,
                    _ => Id::X448,
                };
                PKey::public_key_from_raw_bytes(&raw, key_id).map_err(ssl_err)?
            }
            other => {
                return Err(TokenError::Default(format!(
                    "unknown key algorithm {other}"
                )))
            }
        };

        pkey.public_key_to_der().map_err(ssl_err)
    }

    /// Curve of a stored EC public key: by keyspec name first, then by the
    /// `ecParams` OID.
    fn stored_curve(&self, props: &Props, file: &Path) -> TokenResult<&'static curves::NamedCurve> {
        if let Some(name) = prop(props, PROP_KEYSPEC) {
            if let Some(curve) = curves::by_name(name) {
                return Ok(curve);
            }
        }
        let ec_params = hex_prop(props, PROP_EC_PARAMS, file)?;
        if asn1::is_oid(&ec_params) {
            return curves::require_by_oid(&asn1::decode_oid(&ec_params)?);
        }
        Err(TokenError::Default(format!(
            "cannot determine the curve of {}",
            file.display()
        )))
    }

    fn curve_oid_of(&self, props: &Props, file: &Path) -> TokenResult<String> {
        let ec_params = hex_prop(props, PROP_EC_PARAMS, file)?;
        if asn1::is_oid(&ec_params) {
            asn1::decode_oid(&ec_params)
        } else {
            Ok(self.stored_curve(props, file)?.oid.to_string())
        }
    }

    fn decrypted_value(&self, kind: ObjKind, id: &[u8]) -> TokenResult<zeroize::Zeroizing<Vec<u8>>> {
        let encrypted = fs::read(self.value_file(kind, &hex::encode(id)))?;
        self.cryptor.decrypt(&encrypted)
    }

    fn generate_ec_pkey(curve_oid: &str) -> TokenResult<PKey<Private>> {
        let curve = curves::require_by_oid(curve_oid)?;
        let group = EcGroup::from_curve_name(curve.nid).map_err(ssl_err)?;
        let ec = EcKey::generate(&group).map_err(ssl_err)?;
        PKey::from_ec_key(ec).map_err(ssl_err)
    }

    fn generate_edwards_pkey(curve_oid: &str) -> TokenResult<PKey<Private>> {
        match curve_oid {
            ED25519_OID => PKey::generate_ed25519().map_err(ssl_err),
            ED448_OID => PKey::generate_ed448().map_err(ssl_err),
            _ => Err(TokenError::Default(format!(
                "unknown Edwards curve {curve_oid}"
            ))),
        }
    }

    fn generate_montgomery_pkey(curve_oid: &str) -> TokenResult<PKey<Private>> {
        match curve_oid {
            X25519_OID => PKey::generate_x25519().map_err(ssl_err),
            X448_OID => PKey::generate_x448().map_err(ssl_err),
            _ => Err(TokenError::Default(format!(
                "unknown Montgomery curve {curve_oid}"
            ))),
        }
    }

    fn pkcs8(key: &PKey<Private>) -> TokenResult<Vec<u8>> {
        key.private_key_to_pkcs8()
            .map_err(|e| TokenError::Default(format!("could not serialize private key: {e}")))
    }

    fn object_summary(&self, kind: ObjKind, file: &Path) -> String {
        match (Self::id_from_info_filename(file), load_props(file)) {
            (Ok(id), Ok(props)) => {
                let mut handle = Self::handle_for_id(&id);
                if kind == ObjKind::Public {
                    handle += 1;
                }
                let key_type = prop(&props, PROP_KEYTYPE)
                    .and_then(|v| v.parse::<u64>().ok())
                    .map_or_else(|| "?".to_string(), names::ckk_display);
                let label = prop(&props, PROP_LABEL).unwrap_or("<N/A>");
                let keyspec = prop(&props, PROP_KEYSPEC).unwrap_or("");
                let class = names::cko_name(kind.object_class()).unwrap_or("CKO_?");
                format!(
                    "handle={handle}, id={}, label={label}, {}: {key_type}/{keyspec}",
                    hex::encode(&id),
                    class.trim_start_matches("CKO_"),
                )
            }
            _ => format!("error reading object saved in {}", file.display()),
        }
    }
}

fn ssl_err(e: openssl::error::ErrorStack) -> TokenError {
    TokenError::Default(e.to_string())
}

fn private_key_algo(key: &PKey<Private>) -> &'static str {
    match key.id() {
        Id::RSA => "RSA",
        Id::DSA => "DSA",
        Id::EC | Id::SM2 => "EC",
        Id::ED25519 => "Ed25519",
        Id::ED448 => "Ed448",
        Id::X25519 => "X25519",
        Id::X448 => "X448",
        _ => "unknown",
    }
}

fn secret_key_algo(key_type: u64) -> TokenResult<&'static str> {
    Ok(match key_type {
        names::CKK_GENERIC_SECRET => "generic",
        names::CKK_AES => "AES",
        names::CKK_DES3 => "DESede",
        names::CKK_SHA_1_HMAC => "HMACSHA1",
        names::CKK_SHA224_HMAC => "HMACSHA224",
        names::CKK_SHA256_HMAC => "HMACSHA256",
        names::CKK_SHA384_HMAC => "HMACSHA384",
        names::CKK_SHA512_HMAC => "HMACSHA512",
        names::CKK_SHA3_224_HMAC => "HMACSHA3-224",
        names::CKK_SHA3_256_HMAC => "HMACSHA3-256",
        names::CKK_SHA3_384_HMAC => "HMACSHA3-384",
        names::CKK_SHA3_512_HMAC => "HMACSHA3-512",
        _ => {
            return Err(TokenError::Default(format!(
                "unsupported secret key type {}",
                names::ckk_display(key_type)
            )))
        }
    })
}

/// DER X9.62 parameters of the curve, written when the slot is configured
/// without named-curve support.
fn explicit_ec_parameters(ec: &EcKey<Private>) -> TokenResult<Vec<u8>> {
    let nid = ec.group().curve_name().ok_or_else(|| {
        TokenError::Default("EC key is not on a named curve".to_string())
    })?;
    let mut group = EcGroup::from_curve_name(nid).map_err(ssl_err)?;
    group.set_asn1_flag(Asn1Flag::EXPLICIT_CURVE);
    let ec_pub = EcKey::from_public_key(&group, ec.public_key()).map_err(ssl_err)?;
    let spki = PKey::from_ec_key(ec_pub)
        .map_err(ssl_err)?
        .public_key_to_der()
        .map_err(ssl_err)?;
    asn1::spki_algorithm_parameters(&spki)
}

impl P11Slot for EmulatorP11Slot {
    fn core(&self) -> &SlotCore {
        &self.core
    }

    fn key(&self, key_id: &KeyId) -> TokenResult<Option<P11Key>> {
        let hex_id = hex::encode(key_id.id());
        if key_id.object_class() == CKO_SECRET_KEY {
            if !self.info_file(ObjKind::Secret, &hex_id).exists() {
                return Ok(None);
            }
            return Ok(Some(P11Key::secret(key_id.clone())));
        }

        if !self.info_file(ObjKind::Private, &hex_id).exists() {
            return Ok(None);
        }
        let pub_info = self.info_file(ObjKind::Public, &hex_id);
        let props = load_props(&pub_info)?;

        let key = P11Key::private(key_id.clone());
        let key = match key_id.key_type() {
            names::CKK_RSA => key.with_rsa_params(
                hex_prop(&props, PROP_RSA_MODUS, &pub_info)?,
                hex_prop(&props, PROP_RSA_PUBLIC_EXPONENT, &pub_info)?,
            ),
            names::CKK_DSA => key.with_dsa_params(
                hex_prop(&props, PROP_DSA_PRIME, &pub_info)?,
                hex_prop(&props, PROP_DSA_SUBPRIME, &pub_info)?,
                hex_prop(&props, PROP_DSA_BASE, &pub_info)?,
            ),
            names::CKK_EC | names::CKK_EC_EDWARDS | names::CKK_EC_MONTGOMERY
            | names::CKK_VENDOR_SM2 => {
                key.with_ec_params(self.curve_oid_of(&props, &pub_info)?)
            }
            other => {
                return Err(TokenError::Default(format!(
                    "unknown key type {}",
                    names::ckk_display(other)
                )))
            }
        };
        Ok(Some(key))
    }

    fn key_id_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<Option<KeyId>> {
        let id = id.filter(|id| !id.is_empty());
        let label = label.filter(|l| !l.is_empty());
        if id.is_none() && label.is_none() {
            return Ok(None);
        }

        let (kind, info_file, id) = match id {
            None => {
                let label = label.expect("checked above");
                let mut kind = ObjKind::Private;
                let mut files = self.files_for_label(kind, label)?;
                if files.is_empty() {
                    kind = ObjKind::Secret;
                    files = self.files_for_label(kind, label)?;
                }
                if files.is_empty() {
                    return Ok(None);
                }
                if files.len() > 1 {
                    return Err(TokenError::Default(format!(
                        "found more than 1 {} with label={label}",
                        names::cko_name(kind.object_class()).unwrap_or("object"),
                    )));
                }
                let file = files.remove(0);
                let id = Self::id_from_info_filename(&file)?;
                (kind, file, id)
            }
            Some(id) => {
                let hex_id = hex::encode(id);
                let mut kind = ObjKind::Private;
                let mut file = self.info_file(kind, &hex_id);
                if !file.exists() {
                    kind = ObjKind::Secret;
                    file = self.info_file(kind, &hex_id);
                }
                if !file.exists() {
                    return Ok(None);
                }
                (kind, file, id.to_vec())
            }
        };

        let props = load_props(&info_file)?;
        let stored_label = prop(&props, PROP_LABEL).unwrap_or_default().to_string();
        if let Some(label) = label {
            if label != stored_label {
                return Ok(None);
            }
        }
        let key_type = required_prop(&props, PROP_KEYTYPE, &info_file)?
            .parse::<u64>()
            .map_err(|e| {
                TokenError::Default(format!("invalid keytype in {}: {e}", info_file.display()))
            })?;

        let handle = Self::handle_for_id(&id);
        let mut key_id = KeyId::new(handle, kind.object_class(), key_type, id, stored_label);
        if kind == ObjKind::Private {
            key_id = key_id.with_public_key_handle(handle + 1);
        }
        Ok(Some(key_id))
    }

    fn object_exists_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<bool> {
        let id = id.filter(|id| !id.is_empty());
        let label = label.filter(|l| !l.is_empty());
        match id {
            None => {
                let Some(label) = label else {
                    return Err(TokenError::Default(
                        "at least one of id and label must be present".to_string(),
                    ));
                };
                if !self.files_for_label(ObjKind::Private, label)?.is_empty() {
                    return Ok(true);
                }
                Ok(!self.files_for_label(ObjKind::Secret, label)?.is_empty())
            }
            Some(id) => {
                let hex_id = hex::encode(id);
                let mut file = self.info_file(ObjKind::Private, &hex_id);
                if !file.exists() {
                    file = self.info_file(ObjKind::Secret, &hex_id);
                }
                if !file.exists() {
                    return Ok(false);
                }
                match label {
                    None => Ok(true),
                    Some(label) => {
                        let props = load_props(&file)?;
                        Ok(prop(&props, PROP_LABEL) == Some(label))
                    }
                }
            }
        }
    }

    fn public_key(&self, handle: u64) -> TokenResult<Option<Vec<u8>>> {
        let hash = (handle >> 8) as u32;
        for file in self.info_files(ObjKind::Public)? {
            let id = Self::id_from_info_filename(&file)?;
            if stable_hash32(&id) == hash {
                return self.read_public_key_spki(&id).map(Some);
            }
        }
        Ok(None)
    }

    fn show_details(
        &self,
        out: &mut dyn Write,
        object_handle: Option<u64>,
        verbose: bool,
    ) -> std::io::Result<()> {
        if verbose {
            self.write_supported_mechanisms(out)?;
        }

        let Some(handle) = object_handle else {
            writeln!(out, "\nList of objects:")?;
            let mut no = 0;
            for kind in [ObjKind::Secret, ObjKind::Private, ObjKind::Public] {
                for file in self.info_files(kind).map_err(token_to_io)? {
                    no += 1;
                    writeln!(out, "  {no:3}. {}", self.object_summary(kind, &file))?;
                }
            }
            return Ok(());
        };

        writeln!(out, "\nDetails of object with handle {handle}")?;
        let Some((kind, _, file)) = self.find_info_by_handle(handle).map_err(token_to_io)? else {
            writeln!(out, "  error: invalid object handle")?;
            return Ok(());
        };

        let props = load_props(&file).map_err(token_to_io)?;
        let name_len = props
            .iter()
            .map(|(k, _)| k.len())
            .chain(std::iter::once("CLASS".len()))
            .max()
            .unwrap_or(0);
        writeln!(
            out,
            "  {:name_len$}: {}",
            "CLASS",
            names::cko_name(kind.object_class()).unwrap_or("CKO_?")
        )?;
        for (name, value) in &props {
            if name == PROP_SHA1SUM {
                continue;
            }
            let rendered = match name.as_str() {
                PROP_KEYTYPE => value
                    .parse::<u64>()
                    .map_or_else(|_| value.clone(), names::ckk_display),
                PROP_ID | PROP_RSA_MODUS | PROP_RSA_PUBLIC_EXPONENT | PROP_DSA_PRIME
                | PROP_DSA_SUBPRIME | PROP_DSA_BASE | PROP_DSA_VALUE | PROP_EC_PARAMS
                | PROP_EC_POINT => match hex::decode(value) {
                    Ok(bytes) => {
                        let bytes = if name == PROP_EC_POINT {
                            asn1::unwrap_octet_string(&bytes).unwrap_or(bytes)
                        } else {
                            bytes
                        };
                        format!("byte[{}] {}", bytes.len(), hex::encode(&bytes))
                    }
                    Err(_) => value.clone(),
                },
                _ => value.clone(),
            };
            writeln!(out, "  {name:name_len$}: {rendered}")?;
        }
        Ok(())
    }

    fn close(&self) {
        info!("close slot {}", self.core.slot_id());
    }

    fn do_sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        extra_params: Option<&ExtraParams>,
        key_handle: u64,
        content: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let Some((kind, id, _)) = self.find_info_by_handle(key_handle)? else {
            return Err(TokenError::Default(format!(
                "no key with handle {key_handle}"
            )));
        };
        match kind {
            ObjKind::Secret => {
                let value = self.decrypted_value(ObjKind::Secret, &id)?;
                sign::sign_with_secret_key(mechanism, &value, content)
            }
            ObjKind::Private => {
                let encrypted = fs::read(self.value_file(ObjKind::Private, &hex::encode(&id)))?;
                let key = self.cryptor.decrypt_private_key(&encrypted)?;
                sign::sign_with_private_key(mechanism, &key, params, extra_params, content)
            }
            ObjKind::Public => Err(TokenError::Default(
                "cannot sign with a public key".to_string(),
            )),
        }
    }

    fn do_digest_secret_key(&self, mechanism: u64, key_handle: u64) -> TokenResult<Vec<u8>> {
        let Some((kind, id, _)) = self.find_info_by_handle(key_handle)? else {
            return Err(TokenError::Default(format!(
                "no key with handle {key_handle}"
            )));
        };
        if kind != ObjKind::Secret {
            return Err(TokenError::Default(
                "digest_secret_key requires a secret key".to_string(),
            ));
        }
        let md = sign::digest_for_mechanism(mechanism).ok_or_else(|| {
            TokenError::UnsupportedMechanism(names::ckm_display(mechanism))
        })?;
        let value = self.decrypted_value(ObjKind::Secret, &id)?;
        Ok(hash(md, &value).map_err(ssl_err)?.to_vec())
    }

    fn do_destroy_all_objects(&self) -> TokenResult<usize> {
        Err(TokenError::Unsupported(
            "destroy_all_objects is not supported by the emulator".to_string(),
        ))
    }

    fn do_destroy_objects_by_handle(&self, _handles: &[u64]) -> TokenResult<Vec<u64>> {
        Err(TokenError::Unsupported(
            "destroy_objects_by_handle is not supported by the emulator".to_string(),
        ))
    }

    fn do_destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<usize> {
        Ok(self.delete_entries_by_id_label(ObjKind::Private, id, label)?
            + self.delete_entries_by_id_label(ObjKind::Public, id, label)?
            + self.delete_entries_by_id_label(ObjKind::Secret, id, label)?)
    }

    fn do_generate_secret_key(
        &self,
        key_type: u64,
        key_size: Option<u32>,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let key_size = if key_type == names::CKK_DES3 {
            192
        } else {
            key_size.ok_or_else(|| {
                TokenError::Default("key size is required for this key type".to_string())
            })?
        };
        if key_size == 0 || key_size % 8 != 0 {
            return Err(TokenError::Default(format!(
                "key size is not a multiple of 8: {key_size}"
            )));
        }

        let mut key_value = zeroize::Zeroizing::new(vec![0_u8; key_size as usize / 8]);
        OsRng
            .try_fill_bytes(&mut key_value)
            .map_err(|e| TokenError::Default(format!("error generating key: {e}")))?;
        self.save_secret_key(key_type, &key_value, control)
    }

    fn do_import_secret_key(
        &self,
        key_type: u64,
        key_value: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.save_secret_key(key_type, key_value, control)
    }

    fn do_generate_rsa_keypair(
        &self,
        key_size: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let e = BigNum::from_slice(public_exponent).map_err(ssl_err)?;
        let rsa = Rsa::generate_with_e(key_size, &e).map_err(ssl_err)?;
        let key = PKey::from_rsa(rsa).map_err(ssl_err)?;
        self.save_keypair(names::CKK_RSA, &key, control, Some(&key_size.to_string()))
    }

    fn do_generate_rsa_keypair_otf(
        &self,
        key_size: u32,
        public_exponent: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let e = BigNum::from_slice(public_exponent).map_err(ssl_err)?;
        let rsa = Rsa::generate_with_e(key_size, &e).map_err(ssl_err)?;
        Self::pkcs8(&PKey::from_rsa(rsa).map_err(ssl_err)?)
    }

    fn do_generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let p = BigNum::from_slice(p).map_err(ssl_err)?;
        let keyspec = p.num_bits().to_string();
        let q = BigNum::from_slice(q).map_err(ssl_err)?;
        let g = BigNum::from_slice(g).map_err(ssl_err)?;
        let dsa = Dsa::from_pqg(p, q, g)
            .and_then(|dsa| dsa.generate_key())
            .map_err(ssl_err)?;
        let key = PKey::from_dsa(dsa).map_err(ssl_err)?;
        self.save_keypair(names::CKK_DSA, &key, control, Some(&keyspec))
    }

    fn do_generate_dsa_keypair_otf(&self, p: &[u8], q: &[u8], g: &[u8]) -> TokenResult<Vec<u8>> {
        let p = BigNum::from_slice(p).map_err(ssl_err)?;
        let q = BigNum::from_slice(q).map_err(ssl_err)?;
        let g = BigNum::from_slice(g).map_err(ssl_err)?;
        let dsa = Dsa::from_pqg(p, q, g)
            .and_then(|dsa| dsa.generate_key())
            .map_err(ssl_err)?;
        Self::pkcs8(&PKey::from_dsa(dsa).map_err(ssl_err)?)
    }

    fn do_generate_ec_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let curve = curves::require_by_oid(curve_oid)?;
        let key = Self::generate_ec_pkey(curve_oid)?;
        self.save_keypair(names::CKK_EC, &key, control, Some(curve.name))
    }

    fn do_generate_ec_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>> {
        Self::pkcs8(&Self::generate_ec_pkey(curve_oid)?)
    }

    fn do_generate_edwards_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let key = Self::generate_edwards_pkey(curve_oid)?;
        let keyspec = if curve_oid == ED25519_OID {
            "Ed25519"
        } else {
            "Ed448"
        };
        self.save_keypair(names::CKK_EC_EDWARDS, &key, control, Some(keyspec))
    }

    fn do_generate_edwards_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>> {
        Self::pkcs8(&Self::generate_edwards_pkey(curve_oid)?)
    }

    fn do_generate_montgomery_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let key = Self::generate_montgomery_pkey(curve_oid)?;
        let keyspec = if curve_oid == X25519_OID {
            "X25519"
        } else {
            "X448"
        };
        self.save_keypair(names::CKK_EC_MONTGOMERY, &key, control, Some(keyspec))
    }

    fn do_generate_montgomery_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>> {
        Self::pkcs8(&Self::generate_montgomery_pkey(curve_oid)?)
    }

    fn do_generate_sm2_keypair(&self, control: &NewKeyControl) -> TokenResult<KeyId> {
        let group = EcGroup::from_curve_name(Nid::SM2).map_err(ssl_err)?;
        let ec = EcKey::generate(&group).map_err(ssl_err)?;
        let key = PKey::from_ec_key(ec).map_err(ssl_err)?;
        self.save_keypair(names::CKK_VENDOR_SM2, &key, control, Some("sm2p256v1"))
    }

    fn do_generate_sm2_keypair_otf(&self) -> TokenResult<Vec<u8>> {
        let group = EcGroup::from_curve_name(Nid::SM2).map_err(ssl_err)?;
        let ec = EcKey::generate(&group).map_err(ssl_err)?;
        Self::pkcs8(&PKey::from_ec_key(ec).map_err(ssl_err)?)
    }
}

fn token_to_io(e: TokenError) -> std::io::Error {
    match e {
        TokenError::Io(e) => e,
        other => std::io::Error::other(other.to_string()),
    }
}
