//! Declaration arguments attached to exchanges and queues.
//!
//! Persisted as a single `key=value&key=value&` string. Keys and values must
//! not themselves contain `&` or `=`; such entries do not survive a round trip
//! and no escaping is attempted.

use std::collections::BTreeMap;

pub type Arguments = BTreeMap<String, String>;

const PAIR_SEP: char = '&';
const KV_SEP: char = '=';

/// Encodes `args` as `k1=v1&k2=v2&`. An empty map encodes to `""`.
pub fn encode_args(args: &Arguments) -> String {
    let mut out = String::new();
    for (key, value) in args {
        out.push_str(key);
        out.push(KV_SEP);
        out.push_str(value);
        out.push(PAIR_SEP);
    }
    out
}

/// Decodes the `encode_args` format. Empty segments are skipped; a segment
/// without `=` is dropped with a warning.
pub fn decode_args(raw: &str) -> Arguments {
    let mut args = Arguments::new();
    for pair in raw.split(PAIR_SEP).filter(|p| !p.is_empty()) {
        match pair.split_once(KV_SEP) {
            Some((key, value)) => {
                args.insert(key.to_string(), value.to_string());
            }
            None => {
                tracing::warn!(target: "relaymq::args", pair, "Ignoring malformed argument pair");
            }
        }
    }
    args
}
