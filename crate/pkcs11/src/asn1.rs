//! The handful of DER primitives the key store needs.
//!
//! Only OBJECT IDENTIFIER and OCTET STRING handling plus a minimal TLV
//! walker; everything heavier goes through openssl.

use crate::error::{TokenError, TokenResult};

const TAG_OID: u8 = 0x06;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_SEQUENCE: u8 = 0x30;

fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn read_tlv(data: &[u8]) -> TokenResult<(u8, &[u8], &[u8])> {
    if data.len() < 2 {
        return Err(TokenError::Default("truncated DER element".to_string()));
    }
    let tag = data[0];
    let (len, header) = if data[1] < 0x80 {
        (data[1] as usize, 2)
    } else {
        let num_len_bytes = (data[1] & 0x7F) as usize;
        if num_len_bytes == 0 || num_len_bytes > 8 || data.len() < 2 + num_len_bytes {
            return Err(TokenError::Default("invalid DER length".to_string()));
        }
        let mut len = 0_usize;
        for &b in &data[2..2 + num_len_bytes] {
            len = (len << 8) | b as usize;
        }
        (len, 2 + num_len_bytes)
    };
    if data.len() < header + len {
        return Err(TokenError::Default("truncated DER content".to_string()));
    }
    Ok((tag, &data[header..header + len], &data[header + len..]))
}

/// DER-encodes a dotted-decimal OID.
pub fn encode_oid(oid: &str) -> TokenResult<Vec<u8>> {
    let arcs: Vec<u64> = oid
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| TokenError::Default(format!("invalid OID '{oid}'")))
        })
        .collect::<TokenResult<_>>()?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(TokenError::Default(format!("invalid OID '{oid}'")));
    }

    let mut body = Vec::new();
    let mut push_arc = |mut arc: u64| {
        let mut stack = [0_u8; 10];
        let mut n = 0;
        loop {
            stack[n] = (arc & 0x7F) as u8;
            arc >>= 7;
            n += 1;
            if arc == 0 {
                break;
            }
        }
        for i in (0..n).rev() {
            body.push(stack[i] | if i == 0 { 0 } else { 0x80 });
        }
    };
    push_arc(arcs[0] * 40 + arcs[1]);
    for &arc in &arcs[2..] {
        push_arc(arc);
    }

    let mut out = vec![TAG_OID];
    encode_len(body.len(), &mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a DER OID into its dotted-decimal form.
pub fn decode_oid(der: &[u8]) -> TokenResult<String> {
    let (tag, body, rest) = read_tlv(der)?;
    if tag != TAG_OID || !rest.is_empty() || body.is_empty() {
        return Err(TokenError::Default("not a DER OID".to_string()));
    }

    let mut arcs = Vec::new();
    let mut arc: u64 = 0;
    for &b in body {
        arc = (arc << 7) | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            arcs.push(arc);
            arc = 0;
        }
    }
    let first = arcs[0];
    let (a0, a1) = if first < 40 {
        (0, first)
    } else if first < 80 {
        (1, first - 40)
    } else {
        (2, first - 80)
    };
    let mut out = format!("{a0}.{a1}");
    for arc in &arcs[1..] {
        out.push('.');
        out.push_str(&arc.to_string());
    }
    Ok(out)
}

pub fn is_oid(der: &[u8]) -> bool {
    !der.is_empty() && der[0] == TAG_OID
}

/// Wraps `data` in a DER OCTET STRING.
pub fn wrap_octet_string(data: &[u8]) -> Vec<u8> {
    let mut out = vec![TAG_OCTET_STRING];
    encode_len(data.len(), &mut out);
    out.extend_from_slice(data);
    out
}

/// Unwraps a DER OCTET STRING.
pub fn unwrap_octet_string(der: &[u8]) -> TokenResult<Vec<u8>> {
    let (tag, body, rest) = read_tlv(der)?;
    if tag != TAG_OCTET_STRING || !rest.is_empty() {
        return Err(TokenError::Default("not a DER OCTET STRING".to_string()));
    }
    Ok(body.to_vec())
}

/// Extracts the raw algorithm-parameter bytes out of a DER
/// SubjectPublicKeyInfo: `SEQUENCE { SEQUENCE { OID, params }, BIT STRING }`.
pub fn spki_algorithm_parameters(spki_der: &[u8]) -> TokenResult<Vec<u8>> {
    let (tag, body, _) = read_tlv(spki_der)?;
    if tag != TAG_SEQUENCE {
        return Err(TokenError::Default("not a SubjectPublicKeyInfo".to_string()));
    }
    let (tag, alg_body, _) = read_tlv(body)?;
    if tag != TAG_SEQUENCE {
        return Err(TokenError::Default("not a SubjectPublicKeyInfo".to_string()));
    }
    let (tag, oid_body, params) = read_tlv(alg_body)?;
    if tag != TAG_OID {
        return Err(TokenError::Default(
            "missing algorithm OID in SubjectPublicKeyInfo".to_string(),
        ));
    }
    let _ = oid_body;
    if params.is_empty() {
        return Err(TokenError::Default(
            "SubjectPublicKeyInfo carries no algorithm parameters".to_string(),
        ));
    }
    // return the complete parameter TLV
    let (_, _, rest) = read_tlv(params)?;
    Ok(params[..params.len() - rest.len()].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_round_trip() {
        for oid in [
            "1.2.840.10045.2.1",
            "1.2.840.10045.3.1.7",
            "1.3.101.112",
            "1.2.156.10197.1.301",
            "2.5.4.3",
        ] {
            let der = encode_oid(oid).unwrap();
            assert_eq!(decode_oid(&der).unwrap(), oid);
        }
    }

    #[test]
    fn known_encoding() {
        // id-ecPublicKey
        assert_eq!(
            encode_oid("1.2.840.10045.2.1").unwrap(),
            vec![0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01]
        );
    }

    #[test]
    fn octet_string_round_trip() {
        let data = vec![4_u8; 200];
        let wrapped = wrap_octet_string(&data);
        assert_eq!(unwrap_octet_string(&wrapped).unwrap(), data);
        assert!(unwrap_octet_string(&data).is_err());
    }

    #[test]
    fn rejects_garbage_oid() {
        assert!(encode_oid("not.an.oid").is_err());
        assert!(decode_oid(&[0x04, 0x01, 0x00]).is_err());
    }
}
