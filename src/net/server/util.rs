//! Small helpers for services and diagnostics.
use core::future::{ready, Ready};

use std::string::{String, ToString};
use std::vec::Vec;

use super::service::{Request, Service, ServiceError};

/// The length of a DNS message header.
pub const HEADER_LEN: usize = 12;

/// The NOTIMP response code.
const RCODE_NOTIMP: u8 = 4;

//----------- notimp_response() ----------------------------------------------

/// Builds a header-only NOTIMP response to a request.
///
/// The response copies ID, opcode and RD flag of the request, sets QR and
/// the NOTIMP response code, and carries no records. Returns `None` if the
/// request is too short to hold a header.
pub fn notimp_response(request: &[u8]) -> Option<Vec<u8>> {
    let header = request.get(..HEADER_LEN)?;
    let mut response = vec![0; HEADER_LEN];
    response[..2].copy_from_slice(&header[..2]);
    // QR, then the request's opcode and RD bits.
    response[2] = 0x80 | (header[2] & 0x79);
    response[3] = RCODE_NOTIMP;
    Some(response)
}

//----------- notimp_service() -----------------------------------------------

/// A [`Service`] answering every request with NOTIMP.
///
/// Requests shorter than a DNS header are rejected as malformed.
pub fn notimp_service() -> impl Service + Clone + Send + Sync + 'static {
    |request: Request| -> Ready<Result<Vec<Vec<u8>>, ServiceError>> {
        ready(match notimp_response(request.message()) {
            Some(response) => Ok(vec![response]),
            None => Err(ServiceError::Malformed),
        })
    }
}

//----------- to_pcap_text() -------------------------------------------------

/// Formats bytes the way `text2pcap` reads them.
///
/// Paste the output of a trace log line into a file, run `text2pcap` on it
/// and the message can be inspected in Wireshark.
pub(crate) fn to_pcap_text<T: AsRef<[u8]>>(
    bytes: T,
    num_bytes: usize,
) -> String {
    let bytes = bytes.as_ref();
    let num_bytes = num_bytes.min(bytes.len());
    let mut formatted = "000000".to_string();
    let hex_encoded = hex::encode(&bytes[..num_bytes]);
    let mut chars = hex_encoded.chars();
    // Hex encoding always yields pairs.
    while let (Some(a), Some(b)) = (chars.next(), chars.next()) {
        formatted.push(' ');
        formatted.push(a);
        formatted.push(b);
    }
    formatted
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::tls::TlsInfo;
    use std::sync::Arc;
    use tokio::time::Instant;

    const QUERY: &[u8] = &[
        0xAB, 0xCD, 0x01, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x01, // header
        0x00, 0x00, 0x01, 0x00, 0x01, // root, A, IN
    ];

    #[test]
    fn notimp_copies_id_and_flags() {
        let response = notimp_response(QUERY).unwrap();
        assert_eq!(
            response,
            vec![0xAB, 0xCD, 0x81, 0x04, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn notimp_keeps_opcode() {
        let mut query = QUERY.to_vec();
        // Opcode 4 (NOTIFY), RD clear.
        query[2] = 0x20;
        let response = notimp_response(&query).unwrap();
        assert_eq!(response[2], 0xA0);
    }

    #[test]
    fn short_requests_get_nothing() {
        assert!(notimp_response(&QUERY[..11]).is_none());
        assert!(notimp_response(&[]).is_none());
    }

    #[tokio::test]
    async fn notimp_service_responds() {
        let svc = notimp_service();
        let request = |msg: &[u8]| {
            Request::new(
                msg.to_vec(),
                "192.0.2.1:4321".parse().unwrap(),
                Instant::now(),
                Arc::new(TlsInfo::default()),
            )
        };
        let out = svc.call(request(QUERY)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][3], RCODE_NOTIMP);
        assert_eq!(
            svc.call(request(&[1, 2, 3])).await,
            Err(ServiceError::Malformed)
        );
    }

    #[test]
    fn pcap_text() {
        assert_eq!(to_pcap_text([0x00u8, 0x1f, 0xff], 3), "000000 00 1f ff");
        assert_eq!(to_pcap_text([0x00u8, 0x1f, 0xff], 2), "000000 00 1f");
        assert_eq!(to_pcap_text([0u8; 0], 0), "000000");
        // More octets asked for than there are.
        assert_eq!(to_pcap_text([0xabu8], 4), "000000 ab");
    }
}
