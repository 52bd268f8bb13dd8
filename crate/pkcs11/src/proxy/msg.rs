//! Wire messages of the HSM proxy protocol.
//!
//! Every request is the CBOR array `[slot_id, payload]` where the payload is
//! `null` or an action-specific message; the action tag itself travels out of
//! band with the transport. Responses are single CBOR messages typed by the
//! [`ProxyMessage`] envelope.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    error::{TokenError, TokenResult},
    key::P11Key,
    params::{ExtraParams, P11Params},
    slot::{KeyId, MechanismInfo, NewKeyControl, SlotId},
};

/// The closed set of proxy actions; the wire tag of an action is its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[repr(u16)]
pub enum ProxyAction {
    #[strum(serialize = "moduleCaps")]
    ModuleCaps = 0,
    #[strum(serialize = "slotIds")]
    SlotIds = 1,
    #[strum(serialize = "mechInfos")]
    MechInfos = 2,
    #[strum(serialize = "publicKeyByHandle")]
    PublicKeyByHandle = 3,
    #[strum(serialize = "keyByKeyId")]
    KeyByKeyId = 4,
    #[strum(serialize = "keyByIdLabel")]
    KeyByIdLabel = 5,
    #[strum(serialize = "keyIdByIdLabel")]
    KeyIdByIdLabel = 6,
    #[strum(serialize = "objectExistsByIdLabel")]
    ObjectExistsByIdLabel = 7,
    #[strum(serialize = "destroyAllObjects")]
    DestroyAllObjects = 8,
    #[strum(serialize = "destroyObjectsByHandle")]
    DestroyObjectsByHandle = 9,
    #[strum(serialize = "destroyObjectsByIdLabel")]
    DestroyObjectsByIdLabel = 10,
    #[strum(serialize = "genSecretKey")]
    GenSecretKey = 11,
    #[strum(serialize = "importSecretKey")]
    ImportSecretKey = 12,
    #[strum(serialize = "genRSAKeypair")]
    GenRsaKeypair = 13,
    #[strum(serialize = "genRSAKeypairOtf")]
    GenRsaKeypairOtf = 14,
    #[strum(serialize = "genDSAKeypair2")]
    GenDsaKeypair2 = 15,
    #[strum(serialize = "genDSAKeypair")]
    GenDsaKeypair = 16,
    #[strum(serialize = "genDSAKeypairOtf")]
    GenDsaKeypairOtf = 17,
    #[strum(serialize = "genECKeypair")]
    GenEcKeypair = 18,
    #[strum(serialize = "genECKeypairOtf")]
    GenEcKeypairOtf = 19,
    #[strum(serialize = "genSM2Keypair")]
    GenSm2Keypair = 20,
    #[strum(serialize = "genSM2KeypairOtf")]
    GenSm2KeypairOtf = 21,
    #[strum(serialize = "showDetails")]
    ShowDetails = 22,
    #[strum(serialize = "sign")]
    Sign = 23,
    #[strum(serialize = "digestSecretKey")]
    DigestSecretKey = 24,
}

impl ProxyAction {
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        use ProxyAction::*;
        Some(match tag {
            0 => ModuleCaps,
            1 => SlotIds,
            2 => MechInfos,
            3 => PublicKeyByHandle,
            4 => KeyByKeyId,
            5 => KeyByIdLabel,
            6 => KeyIdByIdLabel,
            7 => ObjectExistsByIdLabel,
            8 => DestroyAllObjects,
            9 => DestroyObjectsByHandle,
            10 => DestroyObjectsByIdLabel,
            11 => GenSecretKey,
            12 => ImportSecretKey,
            13 => GenRsaKeypair,
            14 => GenRsaKeypairOtf,
            15 => GenDsaKeypair2,
            16 => GenDsaKeypair,
            17 => GenDsaKeypairOtf,
            18 => GenEcKeypair,
            19 => GenEcKeypairOtf,
            20 => GenSm2Keypair,
            21 => GenSm2KeypairOtf,
            22 => ShowDetails,
            23 => Sign,
            24 => DigestSecretKey,
            _ => return None,
        })
    }
}

/// Capabilities of the remote module, fetched once at init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCapsResponse {
    pub read_only: bool,
    pub max_message_size: usize,
    pub secret_key_types: Option<Vec<u64>>,
    pub key_pair_types: Option<Vec<u64>>,
    pub new_object_id_length: Option<usize>,
}

/// The typed response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyMessage {
    ByteArray(Vec<u8>),
    Int(i32),
    Long(i64),
    LongArray(Vec<u64>),
    Boolean(bool),
    KeyId(KeyId),
    P11Key(P11Key),
    MechanismInfos(HashMap<u64, MechanismInfo>),
    ModuleCaps(ModuleCapsResponse),
    SlotIds(Vec<SlotId>),
}

// request messages

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdLabelRequest {
    pub id: Option<Vec<u8>>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub key_handle: u64,
    pub mechanism: u64,
    pub params: Option<P11Params>,
    pub extra_params: Option<ExtraParams>,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSecretKeyRequest {
    pub mechanism: u64,
    pub key_handle: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateSecretKeyRequest {
    pub key_type: u64,
    pub key_size: Option<u32>,
    pub control: NewKeyControl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSecretKeyRequest {
    pub key_type: u64,
    pub key_value: Vec<u8>,
    pub control: NewKeyControl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRsaKeyPairRequest {
    pub key_size: u32,
    pub public_exponent: Vec<u8>,
    pub control: Option<NewKeyControl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateDsaKeyPairBySizeRequest {
    pub p_bits: u32,
    pub q_bits: u32,
    pub control: NewKeyControl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateDsaKeyPairRequest {
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub g: Vec<u8>,
    pub control: Option<NewKeyControl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateEcKeyPairRequest {
    pub curve_oid: String,
    pub control: Option<NewKeyControl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateSm2KeyPairRequest {
    pub control: NewKeyControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowDetailsRequest {
    pub object_handle: Option<u64>,
    pub verbose: bool,
}

fn encode_err(e: impl std::fmt::Display) -> TokenError {
    TokenError::Default(format!("encode error while building the request: {e}"))
}

fn decode_err(e: impl std::fmt::Display) -> TokenError {
    TokenError::Default(format!("decode error while reading the response: {e}"))
}

/// Frames a request as `[slot_id, payload]`.
pub fn encode_request<T: Serialize>(slot_id: u64, payload: Option<&T>) -> TokenResult<Vec<u8>> {
    let payload = match payload {
        Some(payload) => ciborium::Value::serialized(payload).map_err(encode_err)?,
        None => ciborium::Value::Null,
    };
    let request = ciborium::Value::Array(vec![
        ciborium::Value::Integer(slot_id.into()),
        payload,
    ]);
    let mut buf = Vec::new();
    ciborium::into_writer(&request, &mut buf).map_err(encode_err)?;
    Ok(buf)
}

/// Splits a framed request back into slot id and payload value. The server
/// side of the protocol starts here; the client uses it in tests.
pub fn decode_request(bytes: &[u8]) -> TokenResult<(u64, ciborium::Value)> {
    let value: ciborium::Value = ciborium::from_reader(bytes).map_err(decode_err)?;
    let ciborium::Value::Array(mut items) = value else {
        return Err(TokenError::Default(
            "request is not a CBOR array".to_string(),
        ));
    };
    if items.len() != 2 {
        return Err(TokenError::Default(format!(
            "request array has {} elements instead of 2",
            items.len()
        )));
    }
    let payload = items.pop().expect("length checked");
    let slot_id = match items.pop().expect("length checked") {
        ciborium::Value::Integer(i) => u64::try_from(i)
            .map_err(|_| TokenError::Default("slot id is not a uint64".to_string()))?,
        _ => {
            return Err(TokenError::Default(
                "slot id is not an integer".to_string(),
            ))
        }
    };
    Ok((slot_id, payload))
}

/// Decodes a response; CBOR `null` maps onto `None`.
pub fn decode_response(bytes: &[u8]) -> TokenResult<Option<ProxyMessage>> {
    let value: ciborium::Value = ciborium::from_reader(bytes).map_err(decode_err)?;
    if matches!(value, ciborium::Value::Null) {
        return Ok(None);
    }
    value.deserialized().map(Some).map_err(decode_err)
}

pub fn encode_response(message: Option<&ProxyMessage>) -> TokenResult<Vec<u8>> {
    let mut buf = Vec::new();
    match message {
        Some(message) => ciborium::into_writer(message, &mut buf).map_err(encode_err)?,
        None => ciborium::into_writer(&ciborium::Value::Null, &mut buf).map_err(encode_err)?,
    }
    Ok(buf)
}

/// Decodes the payload of a framed request into a concrete message.
pub fn payload_as<T: DeserializeOwned>(payload: &ciborium::Value) -> TokenResult<T> {
    payload.deserialized().map_err(decode_err)
}

fn wrong_type(expected: &str) -> TokenError {
    TokenError::Default(format!("response is not a {expected}"))
}

pub fn expect_byte_array(response: Option<ProxyMessage>) -> TokenResult<Option<Vec<u8>>> {
    match response {
        None => Ok(None),
        Some(ProxyMessage::ByteArray(bytes)) => Ok(Some(bytes)),
        Some(_) => Err(wrong_type("ByteArrayMessage")),
    }
}

pub fn expect_int(response: Option<ProxyMessage>) -> TokenResult<Option<i32>> {
    match response {
        None => Ok(None),
        Some(ProxyMessage::Int(value)) => Ok(Some(value)),
        Some(_) => Err(wrong_type("IntMessage")),
    }
}

pub fn expect_long_array(response: Option<ProxyMessage>) -> TokenResult<Option<Vec<u64>>> {
    match response {
        None => Ok(None),
        Some(ProxyMessage::LongArray(values)) => Ok(Some(values)),
        Some(_) => Err(wrong_type("LongArrayMessage")),
    }
}

pub fn expect_boolean(response: Option<ProxyMessage>) -> TokenResult<bool> {
    match response {
        Some(ProxyMessage::Boolean(value)) => Ok(value),
        _ => Err(wrong_type("BooleanMessage")),
    }
}

pub fn expect_key_id(response: Option<ProxyMessage>) -> TokenResult<Option<KeyId>> {
    match response {
        None => Ok(None),
        Some(ProxyMessage::KeyId(key_id)) => Ok(Some(key_id)),
        Some(_) => Err(wrong_type("KeyIdMessage")),
    }
}

pub fn expect_p11_key(response: Option<ProxyMessage>) -> TokenResult<Option<P11Key>> {
    match response {
        None => Ok(None),
        Some(ProxyMessage::P11Key(key)) => Ok(Some(key)),
        Some(_) => Err(wrong_type("P11KeyResponse")),
    }
}

pub fn expect_mechanism_infos(
    response: Option<ProxyMessage>,
) -> TokenResult<HashMap<u64, MechanismInfo>> {
    match response {
        None => Ok(HashMap::new()),
        Some(ProxyMessage::MechanismInfos(infos)) => Ok(infos),
        Some(_) => Err(wrong_type("GetMechanismInfosResponse")),
    }
}

pub fn expect_module_caps(response: Option<ProxyMessage>) -> TokenResult<ModuleCapsResponse> {
    match response {
        Some(ProxyMessage::ModuleCaps(caps)) => Ok(caps),
        _ => Err(wrong_type("ModuleCapsResponse")),
    }
}

pub fn expect_slot_ids(response: Option<ProxyMessage>) -> TokenResult<Vec<SlotId>> {
    match response {
        Some(ProxyMessage::SlotIds(slot_ids)) => Ok(slot_ids),
        _ => Err(wrong_type("SlotIdsResponse")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_tags_are_stable() {
        assert_eq!(ProxyAction::ModuleCaps.tag(), 0);
        assert_eq!(ProxyAction::GenRsaKeypair.tag(), 13);
        assert_eq!(ProxyAction::GenEcKeypairOtf.tag(), 19);
        assert_eq!(ProxyAction::DigestSecretKey.tag(), 24);
        assert_eq!(
            ProxyAction::from_tag(19),
            Some(ProxyAction::GenEcKeypairOtf)
        );
        assert_eq!(ProxyAction::from_tag(25), None);
    }

    #[test]
    fn action_names_match_the_wire_vocabulary() {
        assert_eq!(ProxyAction::GenRsaKeypair.to_string(), "genRSAKeypair");
        assert_eq!(ProxyAction::GenEcKeypairOtf.to_string(), "genECKeypairOtf");
        assert_eq!(
            "keyIdByIdLabel".parse::<ProxyAction>().unwrap(),
            ProxyAction::KeyIdByIdLabel
        );
        assert!("noSuchAction".parse::<ProxyAction>().is_err());
    }

    #[test]
    fn request_framing_round_trip() {
        let request = GenerateEcKeyPairRequest {
            curve_oid: "1.2.840.10045.3.1.7".to_string(),
            control: None,
        };
        let bytes = encode_request(800_000, Some(&request)).unwrap();
        let (slot_id, payload) = decode_request(&bytes).unwrap();
        assert_eq!(slot_id, 800_000);
        assert_eq!(payload_as::<GenerateEcKeyPairRequest>(&payload).unwrap(), request);
    }

    #[test]
    fn null_payload_round_trip() {
        let bytes = encode_request::<()>(7, None).unwrap();
        let (slot_id, payload) = decode_request(&bytes).unwrap();
        assert_eq!(slot_id, 7);
        assert!(matches!(payload, ciborium::Value::Null));
    }

    #[test]
    fn response_round_trip() {
        let message = ProxyMessage::LongArray(vec![1, 2, 3]);
        let bytes = encode_response(Some(&message)).unwrap();
        assert_eq!(decode_response(&bytes).unwrap(), Some(message));

        let bytes = encode_response(None).unwrap();
        assert_eq!(decode_response(&bytes).unwrap(), None);
    }

    #[test]
    fn response_type_mismatch_is_detected() {
        let err = expect_key_id(Some(ProxyMessage::ByteArray(vec![1]))).unwrap_err();
        assert_eq!(err.to_string(), "response is not a KeyIdMessage");
    }
}
