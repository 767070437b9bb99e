use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

/// Largest advertising payload the module accepts without dropping off the
/// bus. Exceeding it is a programming error, not a runtime condition.
pub const MAX_ADV_PAYLOAD: usize = 230;

/// AD length byte, AD type, company id, marker.
pub const PAYLOAD_HEADER: usize = 8;

/// Company identifier carried in the manufacturer-specific field.
pub const COMPANY_ID: [u8; 2] = [0x09, 0x00];

const AD_TYPE_MANUFACTURER: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload size {0} outside legal range {min}..={max}", min = PAYLOAD_HEADER, max = MAX_ADV_PAYLOAD)]
    SizeOutOfRange(usize),
}

/// One generated advertising payload: a single manufacturer-specific AD
/// structure with the round-trip marker up front and random filler behind.
#[derive(Debug, Clone)]
pub struct AdvPayload {
    pub marker: u32,
    bytes: Vec<u8>,
}

impl AdvPayload {
    /// Layout: [len][0xFF][company id][marker BE][filler]. `total_len` is the
    /// full on-air size and must stay within the module's safe bound.
    pub fn generate(marker: u32, total_len: usize) -> Result<Self, PayloadError> {
        if !(PAYLOAD_HEADER..=MAX_ADV_PAYLOAD).contains(&total_len) {
            return Err(PayloadError::SizeOutOfRange(total_len));
        }
        let mut bytes = Vec::with_capacity(total_len);
        bytes.push((total_len - 1) as u8);
        bytes.push(AD_TYPE_MANUFACTURER);
        bytes.extend_from_slice(&COMPANY_ID);
        bytes.extend_from_slice(&marker.to_be_bytes());
        let mut filler = vec![0u8; total_len - PAYLOAD_HEADER];
        rand::thread_rng().fill(&mut filler[..]);
        bytes.extend_from_slice(&filler);
        Ok(Self { marker, bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Tracks which markers count as fresh. The previous marker stays acceptable
/// for one grace period after a refresh so frames still in flight with the
/// old payload are not miscounted as errors.
#[derive(Debug, Clone)]
pub struct MarkerWindow {
    current: u32,
    previous: Option<u32>,
    refreshed_at: Instant,
    grace: Duration,
}

impl MarkerWindow {
    pub fn new(initial: u32, grace: Duration) -> Self {
        Self {
            current: initial,
            previous: None,
            refreshed_at: Instant::now(),
            grace,
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Record a payload refresh.
    pub fn advance(&mut self, next: u32) {
        self.previous = Some(self.current);
        self.current = next;
        self.refreshed_at = Instant::now();
    }

    pub fn accepts(&self, marker: u32) -> bool {
        if marker == self.current {
            return true;
        }
        self.previous == Some(marker) && self.refreshed_at.elapsed() < self.grace
    }
}

/// Validation verdict for one received advertising report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    MarkerMismatch,
    SizeInvalid,
    Malformed,
}

/// Check one reported payload against the active marker window. Pure with
/// respect to the window state; the same bytes always yield the same verdict.
pub fn validate(bytes: &[u8], window: &MarkerWindow) -> Verdict {
    if bytes.len() > MAX_ADV_PAYLOAD {
        return Verdict::SizeInvalid;
    }
    let Some(marker) = find_marker(bytes) else {
        return Verdict::Malformed;
    };
    if window.accepts(marker) {
        Verdict::Ok
    } else {
        Verdict::MarkerMismatch
    }
}

/// Walk the AD structures and pull the marker out of our manufacturer field.
fn find_marker(bytes: &[u8]) -> Option<u32> {
    let mut rest = bytes;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || len > tail.len() {
            return None;
        }
        let (field, next) = tail.split_at(len);
        if field[0] == AD_TYPE_MANUFACTURER && field[1..].starts_with(&COMPANY_ID) {
            let marker = field.get(3..7)?;
            return Some(u32::from_be_bytes(marker.try_into().ok()?));
        }
        rest = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOREVER: Duration = Duration::from_secs(3600);

    #[test]
    fn generate_respects_size_bounds() {
        assert!(matches!(
            AdvPayload::generate(1, PAYLOAD_HEADER - 1),
            Err(PayloadError::SizeOutOfRange(7))
        ));
        assert!(matches!(
            AdvPayload::generate(1, MAX_ADV_PAYLOAD + 1),
            Err(PayloadError::SizeOutOfRange(231))
        ));
        assert_eq!(
            AdvPayload::generate(1, PAYLOAD_HEADER).unwrap().size(),
            PAYLOAD_HEADER
        );
        assert_eq!(
            AdvPayload::generate(1, MAX_ADV_PAYLOAD).unwrap().size(),
            MAX_ADV_PAYLOAD
        );
    }

    #[test]
    fn generated_layout_carries_marker() {
        let p = AdvPayload::generate(0x00C0FFEE, 64).unwrap();
        let b = p.bytes();
        assert_eq!(b.len(), 64);
        assert_eq!(b[0], 63);
        assert_eq!(b[1], 0xFF);
        assert_eq!(&b[2..4], &COMPANY_ID);
        assert_eq!(find_marker(b), Some(0x00C0FFEE));
    }

    #[test]
    fn validator_accepts_current_marker() {
        let window = MarkerWindow::new(7, FOREVER);
        let p = AdvPayload::generate(7, 40).unwrap();
        assert_eq!(validate(p.bytes(), &window), Verdict::Ok);
    }

    #[test]
    fn validator_is_idempotent() {
        let window = MarkerWindow::new(7, FOREVER);
        let p = AdvPayload::generate(9, 40).unwrap();
        let first = validate(p.bytes(), &window);
        assert_eq!(first, Verdict::MarkerMismatch);
        assert_eq!(validate(p.bytes(), &window), first);
    }

    #[test]
    fn previous_marker_tolerated_within_grace() {
        let mut window = MarkerWindow::new(1, FOREVER);
        window.advance(2);
        let old = AdvPayload::generate(1, 40).unwrap();
        let new = AdvPayload::generate(2, 40).unwrap();
        assert_eq!(validate(old.bytes(), &window), Verdict::Ok);
        assert_eq!(validate(new.bytes(), &window), Verdict::Ok);
        // Two generations back is never acceptable.
        window.advance(3);
        assert_eq!(validate(old.bytes(), &window), Verdict::MarkerMismatch);
    }

    #[test]
    fn previous_marker_rejected_after_grace() {
        let mut window = MarkerWindow::new(1, Duration::ZERO);
        window.advance(2);
        let old = AdvPayload::generate(1, 40).unwrap();
        assert_eq!(validate(old.bytes(), &window), Verdict::MarkerMismatch);
    }

    #[test]
    fn oversize_report_is_size_invalid() {
        let window = MarkerWindow::new(1, FOREVER);
        let bytes = vec![0u8; MAX_ADV_PAYLOAD + 1];
        assert_eq!(validate(&bytes, &window), Verdict::SizeInvalid);
    }

    #[test]
    fn structural_garbage_is_malformed() {
        let window = MarkerWindow::new(1, FOREVER);
        // Truncated: length byte runs past the end.
        assert_eq!(validate(&[0x10, 0xFF, 0x09], &window), Verdict::Malformed);
        // No manufacturer field at all.
        assert_eq!(
            validate(&[0x02, 0x01, 0x06], &window),
            Verdict::Malformed
        );
        // Manufacturer field too short to hold a marker.
        assert_eq!(
            validate(&[0x04, 0xFF, 0x09, 0x00, 0xAA], &window),
            Verdict::Malformed
        );
        assert_eq!(validate(&[], &window), Verdict::Malformed);
    }

    #[test]
    fn marker_found_behind_foreign_fields() {
        let window = MarkerWindow::new(0x2A, FOREVER);
        // Flags field, then another vendor's field, then ours.
        let mut bytes = vec![0x02, 0x01, 0x06];
        bytes.extend_from_slice(&[0x04, 0xFF, 0x4C, 0x00, 0x10]);
        bytes.extend_from_slice(&[0x07, 0xFF, 0x09, 0x00, 0x00, 0x00, 0x00, 0x2A]);
        assert_eq!(validate(&bytes, &window), Verdict::Ok);
    }
}
