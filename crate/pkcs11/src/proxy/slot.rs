//! Slot that tunnels every operation to the remote HSM server.

use std::{collections::HashMap, io::Write, sync::Arc};

use serde::Serialize;
use tracing::warn;

use crate::{
    conf::P11ModuleConf,
    error::{TokenError, TokenResult},
    key::P11Key,
    names::{self, CKF_GENERATE_KEY_PAIR},
    params::{ExtraParams, P11Params},
    proxy::{
        msg::{self, ProxyAction, ProxyMessage},
        ProxyTransport,
    },
    slot::{
        is_edwards_curve, is_montgomery_curve, KeyId, MechanismInfo, NewKeyControl, P11Slot,
        SlotCore, SlotId,
    },
};

pub struct HsmProxyP11Slot {
    core: SlotCore,
    transport: Arc<dyn ProxyTransport>,
}

impl HsmProxyP11Slot {
    pub(super) fn new(
        conf: &P11ModuleConf,
        slot_id: SlotId,
        read_only: bool,
        transport: Arc<dyn ProxyTransport>,
    ) -> TokenResult<Self> {
        let mut core = SlotCore::new(
            conf.name(),
            slot_id,
            read_only,
            conf.secret_key_types().map(<[u64]>::to_vec),
            conf.key_pair_types().map(<[u64]>::to_vec),
            conf.new_object_conf().clone(),
        );

        let supported: HashMap<u64, MechanismInfo> = msg::expect_mechanism_infos(send(
            &transport,
            slot_id.id(),
            ProxyAction::MechInfos,
            None::<&()>,
        )?)?;
        core.init_mechanisms(supported, conf.mechanism_filter());

        Ok(Self { core, transport })
    }

    fn send<T: Serialize>(
        &self,
        action: ProxyAction,
        payload: Option<&T>,
    ) -> TokenResult<Option<ProxyMessage>> {
        send(&self.transport, self.core.slot_id().id(), action, payload)
    }

    fn id_label_request(id: Option<&[u8]>, label: Option<&str>) -> msg::IdLabelRequest {
        msg::IdLabelRequest {
            id: id.map(<[u8]>::to_vec),
            label: label.map(str::to_string),
        }
    }

    fn required_key_id(response: Option<ProxyMessage>) -> TokenResult<KeyId> {
        msg::expect_key_id(response)?
            .ok_or_else(|| TokenError::Default("server returned no key id".to_string()))
    }

    fn required_bytes(response: Option<ProxyMessage>) -> TokenResult<Vec<u8>> {
        msg::expect_byte_array(response)?
            .ok_or_else(|| TokenError::Default("server returned no data".to_string()))
    }
}

pub(super) fn send<T: Serialize>(
    transport: &Arc<dyn ProxyTransport>,
    slot_id: u64,
    action: ProxyAction,
    payload: Option<&T>,
) -> TokenResult<Option<ProxyMessage>> {
    let request = msg::encode_request(slot_id, payload)?;
    let reply = transport.send(action, &request)?;
    msg::decode_response(&reply)
}

impl P11Slot for HsmProxyP11Slot {
    fn core(&self) -> &SlotCore {
        &self.core
    }

    fn key(&self, key_id: &KeyId) -> TokenResult<Option<P11Key>> {
        msg::expect_p11_key(self.send(ProxyAction::KeyByKeyId, Some(key_id))?)
    }

    fn key_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<Option<P11Key>> {
        let request = Self::id_label_request(id, label);
        msg::expect_p11_key(self.send(ProxyAction::KeyByIdLabel, Some(&request))?)
    }

    fn key_id_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<Option<KeyId>> {
        let request = Self::id_label_request(id, label);
        msg::expect_key_id(self.send(ProxyAction::KeyIdByIdLabel, Some(&request))?)
    }

    fn object_exists_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<bool> {
        if id.is_none_or(|id| id.is_empty()) && label.is_none_or(str::is_empty) {
            return Err(TokenError::Default(
                "at least one of id and label must be present".to_string(),
            ));
        }
        let request = Self::id_label_request(id, label);
        msg::expect_boolean(self.send(ProxyAction::ObjectExistsByIdLabel, Some(&request))?)
    }

    fn public_key(&self, handle: u64) -> TokenResult<Option<Vec<u8>>> {
        msg::expect_byte_array(self.send(ProxyAction::PublicKeyByHandle, Some(&handle))?)
    }

    fn show_details(
        &self,
        out: &mut dyn Write,
        object_handle: Option<u64>,
        verbose: bool,
    ) -> std::io::Result<()> {
        let request = msg::ShowDetailsRequest {
            object_handle,
            verbose,
        };
        match self
            .send(ProxyAction::ShowDetails, Some(&request))
            .and_then(Self::required_bytes)
        {
            Ok(details) => out.write_all(&details),
            Err(e) => write!(out, "ERROR: {e}"),
        }
    }

    fn do_sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        extra_params: Option<&ExtraParams>,
        key_handle: u64,
        content: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let request = msg::SignRequest {
            key_handle,
            mechanism,
            params: params.cloned(),
            extra_params: extra_params.cloned(),
            content: content.to_vec(),
        };
        Self::required_bytes(self.send(ProxyAction::Sign, Some(&request))?)
    }

    fn do_digest_secret_key(&self, mechanism: u64, key_handle: u64) -> TokenResult<Vec<u8>> {
        let request = msg::DigestSecretKeyRequest {
            mechanism,
            key_handle,
        };
        Self::required_bytes(self.send(ProxyAction::DigestSecretKey, Some(&request))?)
    }

    fn do_destroy_all_objects(&self) -> TokenResult<usize> {
        match self
            .send(ProxyAction::DestroyAllObjects, None::<&()>)
            .and_then(msg::expect_int)
        {
            Ok(count) => Ok(count.unwrap_or(0).max(0) as usize),
            Err(e) => {
                warn!("error destroying all objects: {e}");
                Ok(0)
            }
        }
    }

    fn do_destroy_objects_by_handle(&self, handles: &[u64]) -> TokenResult<Vec<u64>> {
        let request = handles.to_vec();
        match self
            .send(ProxyAction::DestroyObjectsByHandle, Some(&request))
            .and_then(msg::expect_long_array)
        {
            Ok(failed) => Ok(failed.unwrap_or_default()),
            Err(e) => {
                warn!("error destroying objects by handle: {e}");
                Ok(handles.to_vec())
            }
        }
    }

    fn do_destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<usize> {
        let request = Self::id_label_request(id, label);
        match self
            .send(ProxyAction::DestroyObjectsByIdLabel, Some(&request))
            .and_then(msg::expect_int)
        {
            Ok(count) => Ok(count.unwrap_or(0).max(0) as usize),
            Err(e) => {
                warn!("error destroying objects by id/label: {e}");
                Ok(0)
            }
        }
    }

    // The generation primitives live on the server; only the higher-level
    // operations below are wired through.

    fn generate_secret_key(
        &self,
        key_type: u64,
        key_size: Option<u32>,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("generate_secret_key")?;
        self.assert_secret_key_type_allowed(key_type)?;
        let request = msg::GenerateSecretKeyRequest {
            key_type,
            key_size,
            control: control.clone(),
        };
        Self::required_key_id(self.send(ProxyAction::GenSecretKey, Some(&request))?)
    }

    fn import_secret_key(
        &self,
        key_type: u64,
        key_value: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("import_secret_key")?;
        self.assert_secret_key_type_allowed(key_type)?;
        let request = msg::ImportSecretKeyRequest {
            key_type,
            key_value: key_value.to_vec(),
            control: control.clone(),
        };
        Self::required_key_id(self.send(ProxyAction::ImportSecretKey, Some(&request))?)
    }

    fn generate_rsa_keypair(
        &self,
        key_size: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("generate_rsa_keypair")?;
        self.assert_keypair_type_allowed(names::CKK_RSA)?;
        self.assert_any_mechanism_supported(
            &[
                names::CKM_RSA_PKCS_KEY_PAIR_GEN,
                names::CKM_RSA_X9_31_KEY_PAIR_GEN,
            ],
            CKF_GENERATE_KEY_PAIR,
        )?;
        let request = msg::GenerateRsaKeyPairRequest {
            key_size,
            public_exponent: public_exponent.to_vec(),
            control: Some(control.clone()),
        };
        Self::required_key_id(self.send(ProxyAction::GenRsaKeypair, Some(&request))?)
    }

    fn generate_rsa_keypair_otf(
        &self,
        key_size: u32,
        public_exponent: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let request = msg::GenerateRsaKeyPairRequest {
            key_size,
            public_exponent: public_exponent.to_vec(),
            control: None,
        };
        Self::required_bytes(self.send(ProxyAction::GenRsaKeypairOtf, Some(&request))?)
    }

    fn generate_dsa_keypair_by_size(
        &self,
        p_bits: u32,
        q_bits: u32,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("generate_dsa_keypair")?;
        self.assert_keypair_type_allowed(names::CKK_DSA)?;
        self.assert_mechanism_supported(names::CKM_DSA_KEY_PAIR_GEN, CKF_GENERATE_KEY_PAIR)?;
        let request = msg::GenerateDsaKeyPairBySizeRequest {
            p_bits,
            q_bits,
            control: control.clone(),
        };
        Self::required_key_id(self.send(ProxyAction::GenDsaKeypair2, Some(&request))?)
    }

    fn generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("generate_dsa_keypair")?;
        self.assert_keypair_type_allowed(names::CKK_DSA)?;
        self.assert_mechanism_supported(names::CKM_DSA_KEY_PAIR_GEN, CKF_GENERATE_KEY_PAIR)?;
        let request = msg::GenerateDsaKeyPairRequest {
            p: p.to_vec(),
            q: q.to_vec(),
            g: g.to_vec(),
            control: Some(control.clone()),
        };
        Self::required_key_id(self.send(ProxyAction::GenDsaKeypair, Some(&request))?)
    }

    fn generate_dsa_keypair_otf(&self, p: &[u8], q: &[u8], g: &[u8]) -> TokenResult<Vec<u8>> {
        let request = msg::GenerateDsaKeyPairRequest {
            p: p.to_vec(),
            q: q.to_vec(),
            g: g.to_vec(),
            control: None,
        };
        Self::required_bytes(self.send(ProxyAction::GenDsaKeypairOtf, Some(&request))?)
    }

    fn generate_ec_keypair(&self, curve_oid: &str, control: &NewKeyControl) -> TokenResult<KeyId> {
        self.assert_writable("generate_ec_keypair")?;
        let gen_mechanism = if is_edwards_curve(curve_oid) {
            self.assert_keypair_type_allowed(names::CKK_EC_EDWARDS)?;
            names::CKM_EC_EDWARDS_KEY_PAIR_GEN
        } else if is_montgomery_curve(curve_oid) {
            self.assert_keypair_type_allowed(names::CKK_EC_MONTGOMERY)?;
            names::CKM_EC_MONTGOMERY_KEY_PAIR_GEN
        } else {
            self.assert_keypair_type_allowed(names::CKK_EC)?;
            names::CKM_EC_KEY_PAIR_GEN
        };
        self.assert_mechanism_supported(gen_mechanism, CKF_GENERATE_KEY_PAIR)?;
        let request = msg::GenerateEcKeyPairRequest {
            curve_oid: curve_oid.to_string(),
            control: Some(control.clone()),
        };
        Self::required_key_id(self.send(ProxyAction::GenEcKeypair, Some(&request))?)
    }

    fn generate_ec_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>> {
        let request = msg::GenerateEcKeyPairRequest {
            curve_oid: curve_oid.to_string(),
            control: None,
        };
        Self::required_bytes(self.send(ProxyAction::GenEcKeypairOtf, Some(&request))?)
    }

    fn generate_sm2_keypair(&self, control: &NewKeyControl) -> TokenResult<KeyId> {
        self.assert_writable("generate_sm2_keypair")?;
        self.assert_keypair_type_allowed(names::CKK_VENDOR_SM2)?;
        self.assert_mechanism_supported(
            names::CKM_VENDOR_SM2_KEY_PAIR_GEN,
            CKF_GENERATE_KEY_PAIR,
        )?;
        let request = msg::GenerateSm2KeyPairRequest {
            control: control.clone(),
        };
        Self::required_key_id(self.send(ProxyAction::GenSm2Keypair, Some(&request))?)
    }

    fn generate_sm2_keypair_otf(&self) -> TokenResult<Vec<u8>> {
        Self::required_bytes(self.send(ProxyAction::GenSm2KeypairOtf, None::<&()>)?)
    }

    fn do_generate_secret_key(
        &self,
        _key_type: u64,
        _key_size: Option<u32>,
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_import_secret_key(
        &self,
        _key_type: u64,
        _key_value: &[u8],
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_generate_rsa_keypair(
        &self,
        _key_size: u32,
        _public_exponent: &[u8],
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_generate_rsa_keypair_otf(
        &self,
        _key_size: u32,
        _public_exponent: &[u8],
    ) -> TokenResult<Vec<u8>> {
        Err(unsupported_primitive())
    }

    fn do_generate_dsa_keypair(
        &self,
        _p: &[u8],
        _q: &[u8],
        _g: &[u8],
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_generate_dsa_keypair_otf(
        &self,
        _p: &[u8],
        _q: &[u8],
        _g: &[u8],
    ) -> TokenResult<Vec<u8>> {
        Err(unsupported_primitive())
    }

    fn do_generate_ec_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_generate_ec_keypair_otf(&self, _curve_oid: &str) -> TokenResult<Vec<u8>> {
        Err(unsupported_primitive())
    }

    fn do_generate_edwards_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_generate_edwards_keypair_otf(&self, _curve_oid: &str) -> TokenResult<Vec<u8>> {
        Err(unsupported_primitive())
    }

    fn do_generate_montgomery_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_generate_montgomery_keypair_otf(&self, _curve_oid: &str) -> TokenResult<Vec<u8>> {
        Err(unsupported_primitive())
    }

    fn do_generate_sm2_keypair(&self, _control: &NewKeyControl) -> TokenResult<KeyId> {
        Err(unsupported_primitive())
    }

    fn do_generate_sm2_keypair_otf(&self) -> TokenResult<Vec<u8>> {
        Err(unsupported_primitive())
    }
}

fn unsupported_primitive() -> TokenError {
    TokenError::Unsupported(
        "local generation primitives are not supported by the proxy client".to_string(),
    )
}

impl HsmProxyP11Slot {
    #[cfg(test)]
    pub(crate) fn for_tests(core: SlotCore, transport: Arc<dyn ProxyTransport>) -> Self {
        Self { core, transport }
    }
}
