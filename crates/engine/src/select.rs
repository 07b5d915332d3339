//! Provider selection
//!
//! Pure function from `(text_length, pool_state)` to a session kind, with
//! hysteresis so a segment near a threshold keeps the previous session
//! instead of thrashing accelerator context.

use lyra_config::SelectorSettings;

use crate::pool::{PoolSnapshot, SessionKind};

/// Pick the session for a segment of `text_len` characters
///
/// Returns `None` when no session is Ready. `prev` is the session used for
/// the previous segment of the same utterance, if any.
pub fn select(
    text_len: usize,
    snapshot: &PoolSnapshot,
    prev: Option<SessionKind>,
    config: &SelectorSettings,
) -> Option<SessionKind> {
    let ready = snapshot.ready_kinds();
    match ready.len() {
        0 => return None,
        1 => return Some(ready[0]),
        _ => {},
    }

    let base = base_choice(text_len, snapshot, config)?;

    // Hysteresis: staying put is cheaper than re-residency when the length
    // criterion was a near miss.
    if let Some(prev) = prev {
        if prev != base && snapshot.is_ready(prev) && within_band(text_len, prev, config) {
            return Some(prev);
        }
    }

    Some(base)
}

fn base_choice(
    text_len: usize,
    snapshot: &PoolSnapshot,
    config: &SelectorSettings,
) -> Option<SessionKind> {
    if text_len <= config.short_cap && snapshot.is_ready(SessionKind::Accelerator) {
        return Some(SessionKind::Accelerator);
    }
    if text_len >= config.long_cap && snapshot.is_ready(SessionKind::CoProcessor) {
        return Some(SessionKind::CoProcessor);
    }
    [
        SessionKind::Generic,
        SessionKind::CoProcessor,
        SessionKind::Accelerator,
    ]
    .into_iter()
    .find(|k| snapshot.is_ready(*k))
}

/// Is `text_len` within the hysteresis band of the threshold that bounds
/// `prev`'s preferred region?
fn within_band(text_len: usize, prev: SessionKind, config: &SelectorSettings) -> bool {
    let boundary = match prev {
        SessionKind::Accelerator => config.short_cap as f64,
        SessionKind::CoProcessor => config.long_cap as f64,
        // The generic region is bounded on both sides; measure against the
        // nearer cap
        SessionKind::Generic => {
            let len = text_len as f64;
            let to_short = (len - config.short_cap as f64).abs();
            let to_long = (len - config.long_cap as f64).abs();
            if to_short <= to_long {
                config.short_cap as f64
            } else {
                config.long_cap as f64
            }
        },
    };
    let distance = (text_len as f64 - boundary).abs();
    distance <= boundary * config.hysteresis_pct
}
