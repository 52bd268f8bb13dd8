//! Hash services over a process-wide bag of reusable digest engines.

use std::{collections::HashMap, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use once_cell::sync::Lazy;
use openssl::hash::{Hasher, MessageDigest};

use crate::{bag::ConcurrentBag, error::SecurityError};

/// Engines per algorithm.
const PARALLELISM: usize = 50;
const BORROW_TIMEOUT: Duration = Duration::from_secs(10);
const BORROW_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha3_224,
    Sha3_256,
    Sha3_384,
    Sha3_512,
}

impl HashAlgo {
    const ALL: [HashAlgo; 9] = [
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
        Self::Sha3_224,
        Self::Sha3_256,
        Self::Sha3_384,
        Self::Sha3_512,
    ];

    fn digest(self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha224 => MessageDigest::sha224(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
            Self::Sha3_224 => MessageDigest::sha3_224(),
            Self::Sha3_256 => MessageDigest::sha3_256(),
            Self::Sha3_384 => MessageDigest::sha3_384(),
            Self::Sha3_512 => MessageDigest::sha3_512(),
        }
    }

    /// Digest length in bytes.
    pub fn length(self) -> usize {
        self.digest().size()
    }
}

static DIGEST_BAGS: Lazy<HashMap<HashAlgo, ConcurrentBag<Hasher>>> = Lazy::new(|| {
    let mut bags = HashMap::new();
    for algo in HashAlgo::ALL {
        let bag = ConcurrentBag::new();
        for _ in 0..PARALLELISM {
            bag.add(Hasher::new(algo.digest()).expect("digest engine must be creatable"));
        }
        bags.insert(algo, bag);
    }
    bags
});

/// Hashes the concatenation of `chunks` with a borrowed digest engine.
pub fn hash(algo: HashAlgo, chunks: &[&[u8]]) -> Result<Vec<u8>, SecurityError> {
    let bag = DIGEST_BAGS
        .get(&algo)
        .expect("every algorithm has a bag");

    let mut hasher = None;
    for _ in 0..BORROW_ATTEMPTS {
        if let Some(h) = bag.borrow(BORROW_TIMEOUT) {
            hasher = Some(h);
            break;
        }
    }
    let Some(mut hasher) = hasher else {
        return Err(SecurityError::Default(
            "could not get idle digest engine".to_string(),
        ));
    };

    let result = (|| {
        for chunk in chunks {
            hasher
                .update(chunk)
                .map_err(|e| SecurityError::Default(format!("digest error: {e}")))?;
        }
        // finish also resets the engine for the next borrower
        hasher
            .finish()
            .map(|digest| digest.to_vec())
            .map_err(|e| SecurityError::Default(format!("digest error: {e}")))
    })();

    bag.requite(hasher);
    result
}

pub fn sha1(data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    hash(HashAlgo::Sha1, &[data])
}

pub fn sha256(data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    hash(HashAlgo::Sha256, &[data])
}

pub fn hex_hash(algo: HashAlgo, chunks: &[&[u8]]) -> Result<String, SecurityError> {
    hash(algo, chunks).map(hex::encode)
}

pub fn base64_hash(algo: HashAlgo, chunks: &[&[u8]]) -> Result<String, SecurityError> {
    hash(algo, chunks).map(|digest| BASE64.encode(digest))
}

pub fn hex_sha1(data: &[u8]) -> Result<String, SecurityError> {
    hex_hash(HashAlgo::Sha1, &[data])
}

pub fn hex_sha256(data: &[u8]) -> Result<String, SecurityError> {
    hex_hash(HashAlgo::Sha256, &[data])
}

pub fn base64_sha1(data: &[u8]) -> Result<String, SecurityError> {
    base64_hash(HashAlgo::Sha1, &[data])
}

pub fn base64_sha256(data: &[u8]) -> Result<String, SecurityError> {
    base64_hash(HashAlgo::Sha256, &[data])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_hash_matches_one_shot() {
        let expected = openssl::hash::hash(MessageDigest::sha256(), b"hello world").unwrap();
        let chunked = hash(HashAlgo::Sha256, &[b"hello", b" ", b"world"]).unwrap();
        assert_eq!(chunked, expected.to_vec());
    }

    #[test]
    fn engines_are_reusable() {
        let first = sha1(b"abc").unwrap();
        let second = sha1(b"abc").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
        // a fresh message must not be polluted by earlier state
        assert_ne!(sha1(b"abcd").unwrap(), first);
    }

    #[test]
    fn helpers_agree() {
        assert_eq!(hex_sha256(b"x").unwrap(), hex::encode(sha256(b"x").unwrap()));
        assert_eq!(
            base64_sha1(b"x").unwrap(),
            BASE64.encode(sha1(b"x").unwrap())
        );
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(HashAlgo::Sha1.length(), 20);
        assert_eq!(HashAlgo::Sha3_512.length(), 64);
    }
}
