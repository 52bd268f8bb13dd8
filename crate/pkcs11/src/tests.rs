//! End-to-end tests over the emulator and the proxy client.

use std::{collections::HashMap, path::Path, sync::Arc};

use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::{hash, MessageDigest},
    pkey::PKey,
    sign::Verifier,
};
use tempfile::TempDir;

use crate::{
    conf::{P11MechanismFilter, P11NewObjectConf},
    emulator::EmulatorP11Module,
    names,
    proxy::{
        msg::{self, ModuleCapsResponse},
        HsmProxyP11Module, HsmProxyP11Slot, ProxyAction, ProxyMessage, ProxyTransport,
    },
    slot::SlotCore,
    KeyId, MechanismInfo, NewKeyControl, P11Module, P11Slot, Pkcs11Conf, SlotId, TokenError,
    TokenResult,
};

const TEST_PASSWORD: &str = "test-1234";
const RSA_F4: &[u8] = &[0x01, 0x00, 0x01];
const P256_OID: &str = "1.2.840.10045.3.1.7";

fn emulator_conf_json(base_dir: &Path, extra: &str) -> String {
    format!(
        r#"{{
          "modules": [{{
            "name": "emu",
            "type": "emulator",
            "nativeLibraries": [{{ "path": "{}" }}],
            "passwordSets": [{{ "slots": [], "passwords": ["{TEST_PASSWORD}"] }}]{extra}
          }}]
        }}"#,
        base_dir.display()
    )
}

fn build_emulator(base_dir: &Path, extra: &str) -> EmulatorP11Module {
    let conf = Pkcs11Conf::from_json(&emulator_conf_json(base_dir, extra)).unwrap();
    let module_conf =
        crate::P11ModuleConf::new(&conf.modules[0], &conf.mechanism_sets, None).unwrap();
    EmulatorP11Module::new(module_conf).unwrap()
}

fn slot0(module: &EmulatorP11Module) -> Arc<dyn P11Slot> {
    let slot_id = module.slot_id_for_index(0).unwrap();
    module.slot(&slot_id).unwrap()
}

#[test]
fn emulator_bootstraps_two_slots() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("p11");
    let module = build_emulator(&base, "");

    let slot_ids = module.slot_ids();
    assert_eq!(slot_ids.len(), 2);
    assert!(slot_ids.contains(&SlotId::new(0, 800_000)));
    assert!(slot_ids.contains(&SlotId::new(1, 800_001)));
    assert!(base.join("0-800000").join("slot.info").is_file());
}

#[test]
fn emulator_rsa_keypair_round_trip() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let key_id = slot
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("rsa-a"))
        .unwrap();
    assert_eq!(key_id.label(), "rsa-a");
    assert_eq!(key_id.key_type(), names::CKK_RSA);
    assert_eq!(key_id.public_key_handle(), Some(key_id.handle() + 1));

    // both halves are on disk
    let hex_id = hex::encode(key_id.id());
    let slot_dir = dir.path().join("p11").join("0-800000");
    assert!(slot_dir.join("privkey").join(format!("{hex_id}.info")).is_file());
    assert!(slot_dir.join("privkey").join(format!("{hex_id}.value")).is_file());
    assert!(slot_dir.join("pubkey").join(format!("{hex_id}.info")).is_file());

    // the key is usable for signing, and the signature verifies
    let key = slot
        .key_by_id_label(Some(key_id.id()), Some("rsa-a"))
        .unwrap()
        .expect("key must be found");
    assert!(!key.is_secret());
    assert_eq!(key.rsa_modulus_len(), Some(256));

    let content = b"hello tessera";
    let signature = slot
        .sign(
            names::CKM_SHA256_RSA_PKCS,
            None,
            None,
            key.key_id().handle(),
            content,
        )
        .unwrap();
    assert_eq!(signature.len(), 256);

    let spki = slot
        .public_key(key.key_id().public_key_handle().unwrap())
        .unwrap()
        .expect("public key must be stored");
    let public = PKey::public_key_from_der(&spki).unwrap();
    let mut verifier = Verifier::new(MessageDigest::sha256(), &public).unwrap();
    assert!(verifier.verify_oneshot(&signature, content).unwrap());

    // an ECDSA mechanism cannot drive an RSA key
    let err = slot
        .sign(names::CKM_ECDSA, None, None, key.key_id().handle(), content)
        .unwrap_err();
    assert!(err.is_unsupported_mechanism(), "got {err}");
}

#[test]
fn emulator_handles_are_stable_across_reopen() {
    let dir = TempDir::new().unwrap();
    let first = build_emulator(&dir.path().join("p11"), "");
    let key_id = slot0(&first)
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("stable"))
        .unwrap();
    drop(first);

    let second = build_emulator(&dir.path().join("p11"), "");
    let reopened = slot0(&second)
        .key_id_by_id_label(Some(key_id.id()), None)
        .unwrap()
        .expect("key must survive the reopen");
    assert_eq!(reopened.handle(), key_id.handle());
    assert_eq!(
        reopened.handle(),
        u64::from(crate::stable_hash32(key_id.id())) << 8
    );
    assert_eq!(reopened, key_id);
}

#[test]
fn emulator_ecdsa_round_trip() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let key_id = slot
        .generate_ec_keypair(P256_OID, &NewKeyControl::new("ec-a"))
        .unwrap();
    let digest = hash(MessageDigest::sha256(), b"sample content").unwrap();
    let signature = slot
        .sign(names::CKM_ECDSA, None, None, key_id.handle(), &digest)
        .unwrap();
    assert_eq!(signature.len(), 64);

    let spki = slot
        .public_key(key_id.public_key_handle().unwrap())
        .unwrap()
        .unwrap();
    let public = PKey::public_key_from_der(&spki).unwrap();
    let ec = public.ec_key().unwrap();
    let sig = EcdsaSig::from_private_components(
        BigNum::from_slice(&signature[..32]).unwrap(),
        BigNum::from_slice(&signature[32..]).unwrap(),
    )
    .unwrap();
    assert!(sig.verify(&digest, &ec).unwrap());
}

#[test]
fn emulator_ed25519_round_trip() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let key_id = slot
        .generate_edwards_keypair(crate::slot::ED25519_OID, &NewKeyControl::new("ed-a"))
        .unwrap();
    let content = b"ed25519 signing";
    let signature = slot
        .sign(names::CKM_EDDSA, None, None, key_id.handle(), content)
        .unwrap();
    assert_eq!(signature.len(), 64);

    let spki = slot
        .public_key(key_id.public_key_handle().unwrap())
        .unwrap()
        .unwrap();
    let public = PKey::public_key_from_der(&spki).unwrap();
    let mut verifier = Verifier::new_without_digest(&public).unwrap();
    assert!(verifier.verify_oneshot(&signature, content).unwrap());
}

#[test]
fn emulator_secret_key_hmac_and_digest() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let key_id = slot
        .generate_secret_key(names::CKK_SHA256_HMAC, Some(256), &NewKeyControl::new("mac"))
        .unwrap();
    assert_eq!(key_id.object_class(), names::CKO_SECRET_KEY);

    let signature = slot
        .sign(names::CKM_SHA256_HMAC, None, None, key_id.handle(), b"data")
        .unwrap();
    assert_eq!(signature.len(), 32);

    let digest = slot
        .digest_secret_key(names::CKM_SHA_1, key_id.handle())
        .unwrap();
    assert_eq!(digest.len(), 20);
}

#[test]
fn emulator_object_lifecycle() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let key_id = slot
        .generate_secret_key(names::CKK_AES, Some(128), &NewKeyControl::new("aes-1"))
        .unwrap();
    assert!(slot
        .object_exists_by_id_label(Some(key_id.id()), Some("aes-1"))
        .unwrap());

    let destroyed = slot
        .destroy_objects_by_id_label(Some(key_id.id()), None)
        .unwrap();
    assert_eq!(destroyed, 1);
    assert!(!slot
        .object_exists_by_id_label(Some(key_id.id()), Some("aes-1"))
        .unwrap());

    // bulk destruction is deliberately unsupported here
    assert!(matches!(
        slot.destroy_all_objects(),
        Err(TokenError::Unsupported(_))
    ));
    assert!(matches!(
        slot.destroy_objects_by_handle(&[key_id.handle()]),
        Err(TokenError::Unsupported(_))
    ));
}

#[test]
fn emulator_duplicate_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let control = NewKeyControl::new("dup-id").with_id(vec![1, 2, 3, 4]);
    slot.generate_secret_key(names::CKK_AES, Some(128), &control)
        .unwrap();
    let err = slot
        .generate_secret_key(names::CKK_AES, Some(128), &control)
        .unwrap_err();
    assert!(err.to_string().contains("duplicate id"), "got {err}");
}

#[test]
fn emulator_duplicate_label_is_uniquified() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let first = slot
        .generate_secret_key(names::CKK_AES, Some(128), &NewKeyControl::new("same"))
        .unwrap();
    let second = slot
        .generate_secret_key(names::CKK_AES, Some(128), &NewKeyControl::new("same"))
        .unwrap();
    assert_eq!(first.label(), "same");
    assert_eq!(second.label(), "same-1");
    assert!(slot
        .key_id_by_id_label(None, Some("same-1"))
        .unwrap()
        .is_some());
}

#[test]
fn emulator_otf_generation_stores_nothing() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);

    let private_key_info = slot.generate_rsa_keypair_otf(2048, RSA_F4).unwrap();
    let key = PKey::private_key_from_pkcs8(&private_key_info).unwrap();
    assert_eq!(key.rsa().unwrap().size(), 256);

    let priv_dir = dir.path().join("p11").join("0-800000").join("privkey");
    assert_eq!(std::fs::read_dir(priv_dir).unwrap().count(), 0);
}

#[test]
fn read_only_module_rejects_mutation_before_disk_access() {
    let dir = TempDir::new().unwrap();
    // initialize the repository first, then reopen read-only
    build_emulator(&dir.path().join("p11"), "");
    let module = build_emulator(&dir.path().join("p11"), r#", "readonly": true"#);
    let slot = slot0(&module);

    let listing = |path: &Path| -> Vec<String> {
        let mut entries: Vec<String> = walk(path);
        entries.sort();
        entries
    };
    let before = listing(dir.path());

    let err = slot
        .generate_secret_key(names::CKK_AES, Some(256), &NewKeyControl::new("nope"))
        .unwrap_err();
    assert!(err.is_read_only(), "got {err}");

    let err = slot
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("nope"))
        .unwrap_err();
    assert!(err.is_read_only(), "got {err}");

    let err = slot
        .destroy_objects_by_id_label(None, Some("nope"))
        .unwrap_err();
    assert!(err.is_read_only(), "got {err}");

    assert_eq!(before, listing(dir.path()));
}

fn walk(path: &Path) -> Vec<String> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path).unwrap() {
        let path = entry.unwrap().path();
        entries.push(path.display().to_string());
        if path.is_dir() {
            entries.extend(walk(&path));
        }
    }
    entries
}

#[test]
fn mechanism_filter_applies_per_slot() {
    let dir = TempDir::new().unwrap();
    let extra = r#",
        "mechanismFilters": [{ "slots": [{ "index": 0 }], "mechanismSet": "basic" }]"#;
    let conf_json = format!(
        r#"{{
          "modules": [{{
            "name": "emu",
            "type": "emulator",
            "nativeLibraries": [{{ "path": "{}" }}],
            "passwordSets": [{{ "slots": [], "passwords": ["{TEST_PASSWORD}"] }}]{extra}
          }}],
          "mechanismSets": [{{
            "name": "basic",
            "mechanisms": ["ALL"],
            "excludeMechanisms": ["CKM_RSA_X_509"]
          }}]
        }}"#,
        dir.path().join("p11").display()
    );
    let conf = Pkcs11Conf::from_json(&conf_json).unwrap();
    let module_conf =
        crate::P11ModuleConf::new(&conf.modules[0], &conf.mechanism_sets, None).unwrap();
    let module = EmulatorP11Module::new(module_conf).unwrap();

    let slot_a = module.slot(&module.slot_id_for_index(0).unwrap()).unwrap();
    let slot_b = module.slot(&module.slot_id_for_index(1).unwrap()).unwrap();

    let key_a = slot_a
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("raw-a"))
        .unwrap();
    let key_b = slot_b
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("raw-b"))
        .unwrap();

    let content = [0x5A_u8; 32];
    let err = slot_a
        .sign(names::CKM_RSA_X_509, None, None, key_a.handle(), &content)
        .unwrap_err();
    assert!(err.is_unsupported_mechanism(), "got {err}");

    let signature = slot_b
        .sign(names::CKM_RSA_X_509, None, None, key_b.handle(), &content)
        .unwrap();
    assert_eq!(signature.len(), 256);
}

#[test]
fn show_details_lists_objects() {
    let dir = TempDir::new().unwrap();
    let module = build_emulator(&dir.path().join("p11"), "");
    let slot = slot0(&module);
    let key_id = slot
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("shown"))
        .unwrap();

    let mut listing = Vec::new();
    slot.show_details(&mut listing, None, true).unwrap();
    let listing = String::from_utf8(listing).unwrap();
    assert!(listing.contains("Supported mechanisms"));
    assert!(listing.contains("label=shown"));

    let mut details = Vec::new();
    slot.show_details(&mut details, Some(key_id.handle()), false)
        .unwrap();
    let details = String::from_utf8(details).unwrap();
    assert!(details.contains("CKO_PRIVATE_KEY"));
    assert!(details.contains("CKK_RSA"));
}

// ---------------------------------------------------------------------------
// proxy client
// ---------------------------------------------------------------------------

const REMOTE_SLOT: u64 = 800_000;

fn remote_mechanisms() -> HashMap<u64, MechanismInfo> {
    let mut mechanisms = HashMap::new();
    for mech in [
        names::CKM_RSA_PKCS_KEY_PAIR_GEN,
        names::CKM_EC_KEY_PAIR_GEN,
        names::CKM_AES_KEY_GEN,
    ] {
        mechanisms.insert(
            mech,
            MechanismInfo::new(0, u64::MAX, names::CKF_GENERATE_KEY_PAIR | names::CKF_GENERATE),
        );
    }
    mechanisms.insert(
        names::CKM_SHA256_RSA_PKCS,
        MechanismInfo::new(0, u64::MAX, names::CKF_SIGN),
    );
    mechanisms
}

/// Scripted server double: checks the framing and replies per action.
struct ScriptedTransport {
    reply_for_gen_rsa: ProxyMessage,
}

impl ProxyTransport for ScriptedTransport {
    fn send(&self, action: ProxyAction, request: &[u8]) -> TokenResult<Vec<u8>> {
        let (slot_id, payload) = msg::decode_request(request)?;
        let reply = match action {
            ProxyAction::ModuleCaps => {
                assert!(matches!(payload, ciborium::Value::Null));
                ProxyMessage::ModuleCaps(ModuleCapsResponse {
                    read_only: false,
                    max_message_size: 16384,
                    secret_key_types: None,
                    key_pair_types: None,
                    new_object_id_length: Some(8),
                })
            }
            ProxyAction::SlotIds => ProxyMessage::SlotIds(vec![SlotId::new(0, REMOTE_SLOT)]),
            ProxyAction::MechInfos => {
                assert_eq!(slot_id, REMOTE_SLOT);
                ProxyMessage::MechanismInfos(remote_mechanisms())
            }
            ProxyAction::GenRsaKeypair => {
                assert_eq!(slot_id, REMOTE_SLOT);
                let request: msg::GenerateRsaKeyPairRequest = msg::payload_as(&payload)?;
                assert_eq!(request.key_size, 2048);
                assert_eq!(request.public_exponent, RSA_F4);
                self.reply_for_gen_rsa.clone()
            }
            ProxyAction::ObjectExistsByIdLabel => ProxyMessage::Boolean(false),
            other => panic!("unexpected action {other}"),
        };
        msg::encode_response(Some(&reply))
    }
}

fn proxy_module(reply_for_gen_rsa: ProxyMessage) -> HsmProxyP11Module {
    let conf_json = r#"{
      "modules": [{
        "name": "proxy",
        "type": "hsmproxy"
      }]
    }"#;
    let conf = Pkcs11Conf::from_json(conf_json).unwrap();
    let module_conf =
        crate::P11ModuleConf::new(&conf.modules[0], &conf.mechanism_sets, None).unwrap();
    HsmProxyP11Module::new(module_conf, Arc::new(ScriptedTransport { reply_for_gen_rsa })).unwrap()
}

#[test]
fn proxy_generate_rsa_keypair() {
    let key_id = KeyId::new(
        17,
        names::CKO_PRIVATE_KEY,
        names::CKK_RSA,
        vec![9, 9],
        "remote-rsa".to_string(),
    );
    let module = proxy_module(ProxyMessage::KeyId(key_id.clone()));
    let slot = module.slot(&SlotId::new(0, REMOTE_SLOT)).unwrap();

    let generated = slot
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("remote-rsa"))
        .unwrap();
    assert_eq!(generated, key_id);
}

#[test]
fn proxy_rejects_mistyped_response() {
    let module = proxy_module(ProxyMessage::ByteArray(vec![1, 2, 3]));
    let slot = module.slot(&SlotId::new(0, REMOTE_SLOT)).unwrap();

    let err = slot
        .generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("remote-rsa"))
        .unwrap_err();
    assert_eq!(err.to_string(), "response is not a KeyIdMessage");
}

#[test]
fn proxy_rejects_unadvertised_mechanisms() {
    let module = proxy_module(ProxyMessage::Boolean(true));
    let slot = module.slot(&SlotId::new(0, REMOTE_SLOT)).unwrap();

    // the remote mechanism table carries no DSA generation
    let err = slot
        .generate_dsa_keypair(&[1], &[2], &[3], &NewKeyControl::new("dsa"))
        .unwrap_err();
    assert!(err.is_unsupported_mechanism(), "got {err}");
}

#[test]
fn proxy_local_primitives_are_unsupported() {
    let core = SlotCore::new(
        "proxy",
        SlotId::new(0, REMOTE_SLOT),
        false,
        None,
        None,
        P11NewObjectConf::default(),
    );
    let transport: Arc<dyn ProxyTransport> = Arc::new(ScriptedTransport {
        reply_for_gen_rsa: ProxyMessage::Boolean(true),
    });
    let slot = HsmProxyP11Slot::for_tests(core, transport);
    assert!(matches!(
        slot.do_generate_rsa_keypair(2048, RSA_F4, &NewKeyControl::new("x")),
        Err(TokenError::Unsupported(_))
    ));
    assert!(matches!(
        slot.do_generate_ec_keypair_otf(P256_OID),
        Err(TokenError::Unsupported(_))
    ));
}

#[test]
fn factory_builds_and_caches_modules() {
    let dir = TempDir::new().unwrap();
    let conf = Pkcs11Conf::from_json(&emulator_conf_json(&dir.path().join("p11"), "")).unwrap();
    let factory = crate::P11CryptServiceFactory::new(conf, None);

    let service = factory.crypt_service("emu").unwrap();
    assert_eq!(service.module().name(), "emu");
    assert_eq!(service.module().slot_ids().len(), 2);

    // second lookup hits the cache and returns the same module
    let again = factory.crypt_service("emu").unwrap();
    assert!(Arc::ptr_eq(service.module(), again.module()));

    assert!(factory.crypt_service("missing").is_err());
}

#[test]
fn unused_filter_entry_leaves_other_slots_alone() {
    // no entry matches slot 1, so every mechanism is permitted there
    let filter = P11MechanismFilter::default();
    assert!(filter.is_permitted(&SlotId::new(1, 800_001), names::CKM_ECDSA, None));
}
