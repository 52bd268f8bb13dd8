//! Pool behavior and end-to-end signing over the emulator.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tempfile::TempDir;
use tessera_pkcs11::{
    emulator::EmulatorP11Module, names, NewKeyControl, P11Module, P11ModuleConf, P11Slot,
    Pkcs11Conf,
};

use crate::{
    concurrent::{ConcurrentContentSigner, ContentSigner},
    error::SecurityError,
    p11::P11ContentSignerBuilder,
};

struct CountingSigner {
    signed: Arc<AtomicUsize>,
    delay: Duration,
}

impl ContentSigner for CountingSigner {
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        thread::sleep(self.delay);
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(data.to_vec())
    }
}

struct FailingSigner;

impl ContentSigner for FailingSigner {
    fn sign(&mut self, _data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        Err(SecurityError::Default("broken engine".to_string()))
    }
}

fn counting_pool(n: usize, delay: Duration) -> (ConcurrentContentSigner, Arc<AtomicUsize>) {
    let signed = Arc::new(AtomicUsize::new(0));
    let engines = (0..n)
        .map(|_| {
            Box::new(CountingSigner {
                signed: signed.clone(),
                delay,
            }) as Box<dyn ContentSigner>
        })
        .collect();
    (ConcurrentContentSigner::new(false, engines).unwrap(), signed)
}

#[test]
fn empty_pool_is_rejected() {
    assert!(ConcurrentContentSigner::new(false, Vec::new()).is_err());
}

#[test]
fn borrow_times_out_when_all_engines_are_loaned() {
    let (pool, _) = counting_pool(2, Duration::ZERO);
    let first = pool.borrow_signer_with_timeout(Duration::from_millis(10)).unwrap();
    let second = pool.borrow_signer_with_timeout(Duration::from_millis(10)).unwrap();

    let started = Instant::now();
    let result = pool.borrow_signer_with_timeout(Duration::from_millis(100));
    let elapsed = started.elapsed();
    assert!(result.is_err());
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");

    drop(first);
    drop(second);
    assert_eq!(pool.idle_signers(), 2);
}

#[test]
fn queued_waiter_wins_a_requited_engine() {
    let (pool, _) = counting_pool(1, Duration::ZERO);
    let pool = Arc::new(pool);
    let loaned = pool.borrow_signer_with_timeout(Duration::from_millis(10)).unwrap();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            pool.borrow_signer_with_timeout(Duration::from_secs(2))
                .map(|_signer| ())
                .is_ok()
        })
    };
    thread::sleep(Duration::from_millis(50));
    drop(loaned);
    assert!(waiter.join().unwrap());
}

#[test]
fn every_borrow_is_requited() {
    let (pool, signed) = counting_pool(3, Duration::from_millis(5));
    let pool = Arc::new(pool);

    let workers: Vec<_> = (0..8_u8)
        .map(|i| {
            let pool = pool.clone();
            thread::spawn(move || pool.sign(&[i]).unwrap())
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(signed.load(Ordering::SeqCst), 8);
    assert_eq!(pool.idle_signers(), 3);
}

#[test]
fn batch_signing_uses_one_borrow() {
    let (pool, signed) = counting_pool(1, Duration::ZERO);
    let signatures = pool.sign_batch(&[b"a", b"bb", b"ccc"]).unwrap();
    assert_eq!(signatures.len(), 3);
    assert_eq!(signatures[2], b"ccc");
    assert_eq!(signed.load(Ordering::SeqCst), 3);
    assert_eq!(pool.idle_signers(), 1);
}

#[test]
fn health_check_never_errors() {
    let (pool, _) = counting_pool(1, Duration::ZERO);
    assert!(pool.is_healthy());

    let engines = vec![Box::new(FailingSigner) as Box<dyn ContentSigner>];
    let broken = ConcurrentContentSigner::new(false, engines).unwrap();
    assert!(!broken.is_healthy());
    // the engine went back despite the failure
    assert_eq!(broken.idle_signers(), 1);
}

#[test]
fn mac_key_digest_is_gated() {
    let (pool, _) = counting_pool(1, Duration::ZERO);
    assert!(pool.set_sha1_of_mac_key(&[0_u8; 20]).is_err());

    let engines = vec![Box::new(FailingSigner) as Box<dyn ContentSigner>];
    let mac_pool = ConcurrentContentSigner::new(true, engines).unwrap();
    assert!(mac_pool.set_sha1_of_mac_key(&[0_u8; 19]).is_err());
    mac_pool.set_sha1_of_mac_key(&[7_u8; 20]).unwrap();
    assert_eq!(mac_pool.sha1_of_mac_key(), Some([7_u8; 20]));
}

// ---------------------------------------------------------------------------
// over the emulator
// ---------------------------------------------------------------------------

fn emulator_slot(dir: &TempDir) -> Arc<dyn P11Slot> {
    let conf_json = format!(
        r#"{{
          "modules": [{{
            "name": "emu",
            "type": "emulator",
            "nativeLibraries": [{{ "path": "{}" }}],
            "passwordSets": [{{ "slots": [], "passwords": ["test-1234"] }}]
          }}]
        }}"#,
        dir.path().join("p11").display()
    );
    let conf = Pkcs11Conf::from_json(&conf_json).unwrap();
    let module_conf = P11ModuleConf::new(&conf.modules[0], &conf.mechanism_sets, None).unwrap();
    let module = EmulatorP11Module::new(module_conf).unwrap();
    let slot_id = module.slot_id_for_index(0).unwrap();
    module.slot(&slot_id).unwrap()
}

#[test]
fn concurrent_rsa_signing_over_the_emulator() {
    let dir = TempDir::new().unwrap();
    let slot = emulator_slot(&dir);

    let key_id = slot
        .generate_rsa_keypair(2048, &[0x01, 0x00, 0x01], &NewKeyControl::new("pool-rsa"))
        .unwrap();
    let key = slot.key(&key_id).unwrap().unwrap();

    let pool = Arc::new(
        P11ContentSignerBuilder::new(slot, key, names::CKM_SHA256_RSA_PKCS)
            .with_parallelism(3)
            .build()
            .unwrap(),
    );
    assert!(!pool.is_mac());
    assert!(pool.is_healthy());

    let workers: Vec<_> = (0..6)
        .map(|i| {
            let pool = pool.clone();
            thread::spawn(move || pool.sign(format!("msg-{i}").as_bytes()).unwrap())
        })
        .collect();
    for worker in workers {
        let signature = worker.join().unwrap();
        assert_eq!(signature.len(), 256);
    }
    assert_eq!(pool.idle_signers(), 3);
}

#[test]
fn mac_signer_records_the_key_digest() {
    let dir = TempDir::new().unwrap();
    let slot = emulator_slot(&dir);

    let key_id = slot
        .generate_secret_key(
            names::CKK_SHA256_HMAC,
            Some(256),
            &NewKeyControl::new("pool-mac"),
        )
        .unwrap();
    let key = slot.key(&key_id).unwrap().unwrap();

    let pool = P11ContentSignerBuilder::new(slot, key, names::CKM_SHA256_HMAC)
        .with_parallelism(2)
        .build()
        .unwrap();
    assert!(pool.is_mac());
    assert_eq!(pool.sha1_of_mac_key().map(|d| d.len()), Some(20));
    assert_eq!(pool.sign(b"payload").unwrap().len(), 32);
}

#[test]
fn builder_rejects_filtered_mechanisms() {
    let dir = TempDir::new().unwrap();
    let slot = emulator_slot(&dir);
    let key_id = slot
        .generate_rsa_keypair(2048, &[0x01, 0x00, 0x01], &NewKeyControl::new("r"))
        .unwrap();
    let key = slot.key(&key_id).unwrap().unwrap();

    // the emulator does not advertise SM2 signing at all
    let err = P11ContentSignerBuilder::new(slot, key, names::CKM_VENDOR_SM2_SM3)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("does not support"), "got {err}");
}
