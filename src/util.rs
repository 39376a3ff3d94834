//! Small self-contained helpers shared across the crate: the canonical device
//! hash, on-wire ID prefixing, and the reconnect backoff law.
//!
//! Grounded on `cc_lib/_util/__init__.py` (`calcDuration`, `calcNthTerm`) and
//! the hashing/prefixing static methods of `cc_lib/client/_client.py`.

use sha1::{Digest, Sha1};
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::device::Device;

/// A manual-reset event: `set` until `clear`ed, then blocks waiters until the
/// next `set`. Backs the `hub_sync_event` gate (§5 Locking discipline)
/// between `sync_hub` and concurrent `add_device`/`delete_device` calls.
pub struct ManualResetEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        ManualResetEvent {
            signaled: Mutex::new(true),
            condvar: Condvar::new(),
        }
    }
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.signaled.lock().expect("manual-reset event poisoned") = true;
        self.condvar.notify_all();
    }

    pub fn clear(&self) {
        *self.signaled.lock().expect("manual-reset event poisoned") = false;
    }

    pub fn wait(&self) {
        let guard = self.signaled.lock().expect("manual-reset event poisoned");
        let _ = self
            .condvar
            .wait_while(guard, |signaled| !*signaled)
            .expect("manual-reset event poisoned");
    }
}

/// Computes the canonical, order-independent hash of a device set (§3).
///
/// `sha1(local_id || name)` per device, hexes sorted ascending, concatenated
/// and hashed again with SHA-1.
pub fn hash_devices<'a>(devices: impl IntoIterator<Item = &'a Device>) -> String {
    let mut hashes: Vec<String> = devices
        .into_iter()
        .map(|d| {
            let mut hasher = Sha1::new();
            hasher.update(d.local_id().as_bytes());
            hasher.update(d.name().as_bytes());
            hex::encode(hasher.finalize())
        })
        .collect();
    hashes.sort();

    let mut hasher = Sha1::new();
    hasher.update(hashes.concat().as_bytes());
    hex::encode(hasher.finalize())
}

/// Prefixes a local device ID for use on the wire: `"{prefix}-{local_id}"`.
pub fn prefix_device_id(prefix: &str, local_id: &str) -> String {
    format!("{prefix}-{local_id}")
}

/// Strips a previously applied prefix from an on-wire device ID.
///
/// Only removes the first occurrence of `"{prefix}-"`, matching the original
/// implementation's `str.replace` which is applied to a value that is known
/// to start with the prefix (the MQTT topic parser always calls this with a
/// fully-prefixed ID straight from a `command/...` topic).
pub fn parse_device_id(prefix: &str, prefixed_id: &str) -> String {
    let needle = format!("{prefix}-");
    prefixed_id.replacen(&needle, "", 1)
}

/// Derives the stable per-`(user, first_run_time)` device ID prefix (§3).
///
/// This follows the original implementation exactly: `md5(user)` is hex
/// encoded, concatenated with the current Unix time (as a float-like
/// string), the result is hashed with `md5` again, and the raw digest is
/// base64url-encoded with padding stripped.
pub fn generate_device_id_prefix(user: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_time = now.as_secs_f64();
    generate_device_id_prefix_at(user, unix_time)
}

pub(crate) fn generate_device_id_prefix_at(user: &str, unix_time: f64) -> String {
    use base64::Engine;

    let user_hash = format!("{:x}", md5::compute(user.as_bytes()));
    let usr_time_str = format!("{user_hash}{unix_time}");
    let digest = md5::compute(usr_time_str.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.0)
}

/// Computes the reconnect backoff duration for attempt `n` (1-based), §4.4.
///
/// `base = min * factor^(n-1)`, rounded up to one significant figure at its
/// own magnitude, capped at `max`.
pub fn calc_duration(min_duration: u64, max_duration: u64, attempt: u32, factor: f64) -> u64 {
    let base_value = (min_duration as f64) * factor.powi(attempt as i32 - 1);
    let ceil_base = base_value.ceil();
    let magnitude = ceil_base.log10().floor() as i32 + 1;
    let unit = 10f64.powi(magnitude - 1);
    let duration = (ceil_base / unit).ceil() * unit;
    (duration as u64).min(max_duration)
}

/// Tiny hex-encoding shim so this module doesn't need to pull in the `hex`
/// crate just for SHA-1 digests (already formatted via `md5::compute`'s
/// `LowerHex` impl above for the md5 digest, but `sha1::Sha1::finalize`
/// returns a raw `GenericArray` without one).
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut s = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(s, "{b:02x}").expect("writing to a String never fails");
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn device(local_id: &str, name: &str) -> Device {
        Device::new(local_id, name, "type-a")
    }

    #[test]
    fn hash_is_order_independent() {
        let a = [device("d1", "A"), device("d2", "B")];
        let b = [device("d2", "B"), device("d1", "A")];
        assert_eq!(hash_devices(&a), hash_devices(&b));
    }

    #[test]
    fn hash_is_sensitive_to_name_changes() {
        let a = [device("d1", "A")];
        let b = [device("d1", "A-renamed")];
        assert_ne!(hash_devices(&a), hash_devices(&b));
    }

    #[test]
    fn hash_is_sensitive_to_id_changes() {
        let a = [device("d1", "A")];
        let b = [device("d2", "A")];
        assert_ne!(hash_devices(&a), hash_devices(&b));
    }

    #[test]
    fn prefix_round_trips() {
        let prefix = "P";
        for id in ["d1", "sensor-7", "a"] {
            let prefixed = prefix_device_id(prefix, id);
            assert_eq!(parse_device_id(prefix, &prefixed), id);
        }
    }

    #[test]
    fn backoff_matches_documented_sequence() {
        let got: Vec<u64> = (1..=6)
            .map(|n| calc_duration(30, 600, n, 1.7))
            .collect();
        assert_eq!(got, vec![30, 60, 90, 200, 300, 500]);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let mut last = 0;
        for n in 1..=20 {
            let d = calc_duration(10, 300, n, 1.5);
            assert!(d >= last);
            assert!(d <= 300);
            last = d;
        }
        assert_eq!(calc_duration(10, 300, 20, 1.5), 300);
    }

    #[test]
    fn backoff_always_has_one_significant_figure() {
        for n in 1..=15 {
            let d = calc_duration(7, 1000, n, 2.1);
            if d == 1000 {
                continue;
            }
            let magnitude = (d as f64).log10().floor() as u32;
            let unit = 10u64.pow(magnitude);
            let k = d / unit;
            assert!((1..=9).contains(&k), "duration {d} has leading digit {k}");
            assert_eq!(k * unit, d);
        }
    }

    #[test]
    fn id_prefix_is_stable_for_fixed_inputs() {
        let a = generate_device_id_prefix_at("alice", 1_700_000_000.123);
        let b = generate_device_id_prefix_at("alice", 1_700_000_000.123);
        assert_eq!(a, b);
        assert!(!a.contains('='));
    }

    #[test]
    fn manual_reset_event_starts_signaled() {
        let event = ManualResetEvent::new();
        event.wait();
        event.clear();
        event.set();
        event.wait();
    }

    #[test]
    fn id_prefix_differs_per_user() {
        let a = generate_device_id_prefix_at("alice", 1_700_000_000.0);
        let b = generate_device_id_prefix_at("bob", 1_700_000_000.0);
        assert_ne!(a, b);
    }
}
