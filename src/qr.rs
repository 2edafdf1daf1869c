//! QR pairing: builds the pairing payload string and tracks the
//! server-issued QR reference lifecycle (first ref valid 60s, each
//! subsequent ref valid 20s, `Timeout` once refs are exhausted).

use std::{collections::VecDeque, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine};
use qrcode::{render::unicode, QrCode};

const FIRST_REF_TTL: Duration = Duration::from_secs(60);
const SUBSEQUENT_REF_TTL: Duration = Duration::from_secs(20);

/// Builds the pairing payload from already base64-encoded components:
/// `"ref,noisePubB64,identityPubB64,advSecretB64"`.
pub fn build_qr_string_from_b64(reference: &str, noise_pub_b64: &str, identity_pub_b64: &str, adv_secret_b64: &str) -> String {
    format!("{reference},{noise_pub_b64},{identity_pub_b64},{adv_secret_b64}")
}

/// Builds the pairing payload from raw key material, base64-encoding each
/// component before assembling the comma-separated string.
pub fn build_qr_string(reference: &str, noise_pub: &[u8], identity_pub: &[u8], adv_secret_key: &[u8]) -> String {
    build_qr_string_from_b64(
        reference,
        &STANDARD.encode(noise_pub),
        &STANDARD.encode(identity_pub),
        &STANDARD.encode(adv_secret_key),
    )
}

/// Renders a QR payload as a Unicode matrix suitable for a terminal.
pub fn render_for_terminal(qr_payload: &str) -> Result<String, String> {
    let code = QrCode::new(qr_payload.as_bytes()).map_err(|error| error.to_string())?;
    Ok(code.render::<unicode::Dense1x2>().build())
}

/// Tracks the queue of QR refs the server hands out during pairing. The
/// first ref is valid for 60s; every ref after that is valid for 20s.
/// Once the queue is drained, the caller must fail with `Timeout`.
pub struct QrRefSchedule {
    refs: VecDeque<String>,
    issued: u32,
}

impl QrRefSchedule {
    pub fn new(refs: Vec<String>) -> Self {
        Self { refs: refs.into(), issued: 0 }
    }

    /// Pops the next ref and its validity duration, or `None` once the
    /// queue is drained.
    pub fn next_ref(&mut self) -> Option<(String, Duration)> {
        let reference = self.refs.pop_front()?;
        let ttl = if self.issued == 0 { FIRST_REF_TTL } else { SUBSEQUENT_REF_TTL };
        self.issued += 1;
        Some((reference, ttl))
    }

    pub fn is_exhausted(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_string_matches_literal_comma_separated_format() {
        let qr = build_qr_string_from_b64("R", "N=", "I=", "A=");
        assert_eq!(qr, "R,N=,I=,A=");
    }

    #[test]
    fn qr_string_from_raw_bytes_base64_encodes_each_component() {
        let qr = build_qr_string("R", &[0x41], &[0x42], &[0x43]);
        assert_eq!(qr, format!("R,{},{},{}", STANDARD.encode([0x41]), STANDARD.encode([0x42]), STANDARD.encode([0x43])));
    }

    #[test]
    fn first_ref_gets_sixty_second_ttl_rest_get_twenty() {
        let mut schedule = QrRefSchedule::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(schedule.next_ref(), Some(("a".to_string(), FIRST_REF_TTL)));
        assert_eq!(schedule.next_ref(), Some(("b".to_string(), SUBSEQUENT_REF_TTL)));
        assert_eq!(schedule.next_ref(), Some(("c".to_string(), SUBSEQUENT_REF_TTL)));
        assert_eq!(schedule.next_ref(), None);
        assert!(schedule.is_exhausted());
    }

    #[test]
    fn rendering_does_not_panic_on_a_typical_payload() {
        let qr = build_qr_string_from_b64("ref", "noise", "identity", "secret");
        assert!(render_for_terminal(&qr).is_ok());
    }
}
