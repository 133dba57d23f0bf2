//! Argument fingerprinting
//!
//! Two strategies, chosen per memoizer:
//!
//! - **Shared**: the argument tree is encoded with `serde_json` into a tagged,
//!   content-only form and hashed. Equal arguments give equal digests in
//!   every process, so this is what networked stores use. Opaque values and
//!   cycles cannot be encoded and are rejected.
//! - **Isolated**: the tree is walked with an explicit worklist and hashed
//!   bottom-up. Shared cells are tracked by identity so cycles terminate, and
//!   opaque values hash by identity. Digests are only meaningful inside the
//!   process that computed them.
//!
//! Sequences and maps are order-sensitive in both modes; sets are not.
//!
//! ```
//! use memora_core::Fingerprinter;
//! use memora_domain::{ArgValue, FingerprintMode};
//!
//! let fp = Fingerprinter::new(FingerprintMode::Shared);
//! let a = fp.digest(&ArgValue::set([1, 2, 3])).unwrap();
//! let b = fp.digest(&ArgValue::set([3, 2, 1])).unwrap();
//! assert_eq!(a, b);
//! assert_eq!(a.len(), 32);
//! ```

use std::collections::{BTreeSet, HashMap};

use memora_domain::{
    ArgValue, CacheError, CacheKey, CacheResult, CallArgs, FingerprintMode, KeyFn, SharedArg,
};
use serde_json::{json, Value};

/// Digest length in bytes before hex encoding
pub const DIGEST_BYTES: usize = 16;

/// Nesting limit for the shared-mode encoder, which recurses
const MAX_PORTABLE_DEPTH: usize = 128;

type Hash = [u8; blake3::OUT_LEN];

/// Turns call arguments into cache keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fingerprinter {
    mode: FingerprintMode,
}

impl Fingerprinter {
    /// Fingerprinter using `mode`
    pub const fn new(mode: FingerprintMode) -> Self {
        Self { mode }
    }

    /// Strategy this fingerprinter uses
    pub const fn mode(&self) -> FingerprintMode {
        self.mode
    }

    /// Hex digest of a single value
    pub fn digest(&self, value: &ArgValue) -> CacheResult<String> {
        let hash = match self.mode {
            FingerprintMode::Shared => *blake3::hash(&portable_bytes(value)?).as_bytes(),
            FingerprintMode::Isolated => isolated_hash(value),
        };
        Ok(hex::encode(&hash[..DIGEST_BYTES]))
    }

    /// Cache key for one call
    ///
    /// With a key function, its result is fingerprinted instead of the
    /// arguments, and any failure is reported as
    /// [`CacheError::InvalidCacheKey`]. Otherwise the arguments minus
    /// `ignored` are fingerprinted and failures are
    /// [`CacheError::Unfingerprintable`].
    pub fn key_for(
        &self,
        function_id: &str,
        args: &CallArgs,
        key_fn: Option<&KeyFn>,
        ignored: &BTreeSet<String>,
    ) -> CacheResult<CacheKey> {
        let digest = match key_fn {
            Some(key_fn) => {
                let value = key_fn(args).ok_or_else(|| {
                    CacheError::InvalidCacheKey(format!(
                        "key function for {function_id} returned no key"
                    ))
                })?;
                self.digest(&value).map_err(|err| match err {
                    CacheError::Unfingerprintable(msg) => CacheError::InvalidCacheKey(msg),
                    other => other,
                })?
            }
            None => self.digest(&args.to_value(ignored))?,
        };
        Ok(CacheKey::new(function_id, digest))
    }
}

// Shared mode
// ---------------------------------------------------------------

fn portable_bytes(value: &ArgValue) -> CacheResult<Vec<u8>> {
    let mut active = Vec::new();
    let encoded = portable(value, &mut active, 0)?;
    to_bytes(&encoded)
}

fn to_bytes(value: &Value) -> CacheResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CacheError::Unfingerprintable(e.to_string()))
}

/// Tagged JSON form of `value`
///
/// `active` holds the shared cells on the current path; meeting one again
/// means the tree is cyclic.
fn portable(value: &ArgValue, active: &mut Vec<usize>, depth: usize) -> CacheResult<Value> {
    if depth > MAX_PORTABLE_DEPTH {
        return Err(CacheError::Unfingerprintable(format!(
            "arguments nested deeper than {MAX_PORTABLE_DEPTH} levels"
        )));
    }
    let next = depth + 1;

    let encoded = match value {
        ArgValue::Unit => json!(["unit"]),
        ArgValue::Bool(b) => json!(["bool", b]),
        ArgValue::Int(i) => json!(["int", i]),
        ArgValue::UInt(u) => json!(["uint", u]),
        ArgValue::Float(f) => json!(["float", float_bits(*f)]),
        ArgValue::Str(s) => json!(["str", &**s]),
        ArgValue::Bytes(b) => json!(["bytes", hex::encode(b)]),
        ArgValue::Seq(items) => {
            let items = items
                .iter()
                .map(|item| portable(item, active, next))
                .collect::<CacheResult<Vec<_>>>()?;
            json!(["seq", items])
        }
        ArgValue::Set(items) => {
            let mut encoded = items
                .iter()
                .map(|item| {
                    let value = portable(item, active, next)?;
                    Ok((to_bytes(&value)?, value))
                })
                .collect::<CacheResult<Vec<_>>>()?;
            encoded.sort_by(|a, b| a.0.cmp(&b.0));
            encoded.dedup_by(|a, b| a.0 == b.0);
            json!(["set", encoded.into_iter().map(|(_, value)| value).collect::<Vec<_>>()])
        }
        ArgValue::Map(pairs) => {
            let pairs = pairs
                .iter()
                .map(|(k, v)| Ok(json!([portable(k, active, next)?, portable(v, active, next)?])))
                .collect::<CacheResult<Vec<_>>>()?;
            json!(["map", pairs])
        }
        ArgValue::Shared(cell) => {
            let addr = cell.addr();
            if active.contains(&addr) {
                return Err(CacheError::Unfingerprintable(
                    "cyclic argument graph has no portable encoding".to_string(),
                ));
            }
            active.push(addr);
            let inner = portable(&cell.get(), active, next);
            active.pop();
            inner?
        }
        ArgValue::Opaque(handle) => {
            return Err(CacheError::Unfingerprintable(format!(
                "value of type {} has no portable encoding",
                handle.type_name()
            )));
        }
    };
    Ok(encoded)
}

/// All NaNs encode alike; signed zeros stay distinct
fn float_bits(f: f64) -> u64 {
    if f.is_nan() {
        f64::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

// Isolated mode
// ---------------------------------------------------------------

mod tag {
    pub const UNIT: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const UINT: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const STR: u8 = 5;
    pub const BYTES: u8 = 6;
    pub const SEQ: u8 = 7;
    pub const SET: u8 = 8;
    pub const MAP: u8 = 9;
    pub const SHARED: u8 = 10;
    pub const BACKREF: u8 = 11;
    pub const OPAQUE: u8 = 12;
}

enum Step {
    Visit(ArgValue),
    /// Fold the top `children` digests into one node digest
    Combine { tag: u8, children: usize, unordered: bool },
}

fn leaf(tag: u8, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

fn combine(tag: u8, mut children: Vec<Hash>, unordered: bool) -> Hash {
    if unordered {
        children.sort_unstable();
        children.dedup();
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&(children.len() as u64).to_le_bytes());
    for child in &children {
        hasher.update(child);
    }
    *hasher.finalize().as_bytes()
}

fn push_children(work: &mut Vec<Step>, tag: u8, items: &[ArgValue], unordered: bool) {
    work.push(Step::Combine { tag, children: items.len(), unordered });
    work.extend(items.iter().rev().cloned().map(Step::Visit));
}

/// Post-order hash of the argument graph without recursion
fn isolated_hash(root: &ArgValue) -> Hash {
    let mut work = vec![Step::Visit(root.clone())];
    let mut digests: Vec<Hash> = Vec::new();
    // Shared cell address -> first-visit ordinal. Cells stay pinned so an
    // address cannot be reused by another allocation mid-walk.
    let mut seen: HashMap<usize, u64> = HashMap::new();
    let mut pinned: Vec<SharedArg> = Vec::new();

    while let Some(step) = work.pop() {
        match step {
            Step::Visit(value) => match value {
                ArgValue::Unit => digests.push(leaf(tag::UNIT, &[])),
                ArgValue::Bool(b) => digests.push(leaf(tag::BOOL, &[u8::from(b)])),
                ArgValue::Int(i) => digests.push(leaf(tag::INT, &i.to_le_bytes())),
                ArgValue::UInt(u) => digests.push(leaf(tag::UINT, &u.to_le_bytes())),
                ArgValue::Float(f) => digests.push(leaf(tag::FLOAT, &float_bits(f).to_le_bytes())),
                ArgValue::Str(s) => digests.push(leaf(tag::STR, s.as_bytes())),
                ArgValue::Bytes(b) => digests.push(leaf(tag::BYTES, &b)),
                ArgValue::Seq(items) => push_children(&mut work, tag::SEQ, &items, false),
                ArgValue::Set(items) => push_children(&mut work, tag::SET, &items, true),
                ArgValue::Map(pairs) => {
                    work.push(Step::Combine {
                        tag: tag::MAP,
                        children: pairs.len() * 2,
                        unordered: false,
                    });
                    for (k, v) in pairs.iter().rev() {
                        work.push(Step::Visit(v.clone()));
                        work.push(Step::Visit(k.clone()));
                    }
                }
                ArgValue::Shared(cell) => {
                    if let Some(ordinal) = seen.get(&cell.addr()) {
                        digests.push(leaf(tag::BACKREF, &ordinal.to_le_bytes()));
                    } else {
                        seen.insert(cell.addr(), seen.len() as u64);
                        work.push(Step::Combine {
                            tag: tag::SHARED,
                            children: 1,
                            unordered: false,
                        });
                        work.push(Step::Visit(cell.get()));
                        pinned.push(cell);
                    }
                }
                ArgValue::Opaque(handle) => {
                    let mut data = (handle.addr() as u64).to_le_bytes().to_vec();
                    data.extend_from_slice(handle.type_name().as_bytes());
                    digests.push(leaf(tag::OPAQUE, &data));
                }
            },
            Step::Combine { tag, children, unordered } => {
                let start = digests.len().saturating_sub(children);
                let folded = combine(tag, digests.split_off(start), unordered);
                digests.push(folded);
            }
        }
    }

    digests.pop().unwrap_or_else(|| leaf(tag::UNIT, &[]))
}

#[cfg(test)]
mod tests {
    //! Unit tests for fingerprint.
    use std::sync::{Arc, Mutex};

    use super::*;

    fn shared() -> Fingerprinter {
        Fingerprinter::new(FingerprintMode::Shared)
    }

    fn isolated() -> Fingerprinter {
        Fingerprinter::new(FingerprintMode::Isolated)
    }

    fn both() -> [Fingerprinter; 2] {
        [shared(), isolated()]
    }

    fn no_ignores() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_digest_is_deterministic_and_fixed_length() {
        for fp in both() {
            let value =
                ArgValue::map([("user", ArgValue::from(42)), ("tags", vec!["a", "b"].into())]);
            let a = fp.digest(&value).unwrap();
            let b = fp.digest(&value.clone()).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), DIGEST_BYTES * 2);
        }
    }

    #[test]
    fn test_sequences_are_order_sensitive() {
        for fp in both() {
            let forward = fp.digest(&ArgValue::seq([1, 2, 3])).unwrap();
            let reverse = fp.digest(&ArgValue::seq([3, 2, 1])).unwrap();
            assert_ne!(forward, reverse);
        }
    }

    #[test]
    fn test_sets_are_order_insensitive() {
        for fp in both() {
            let forward = fp.digest(&ArgValue::set([1, 2, 3])).unwrap();
            let reverse = fp.digest(&ArgValue::set([3, 2, 1])).unwrap();
            assert_eq!(forward, reverse);
        }
    }

    #[test]
    fn test_maps_follow_insertion_order() {
        for fp in both() {
            let ab = fp.digest(&ArgValue::map([("a", 1), ("b", 2)])).unwrap();
            let ba = fp.digest(&ArgValue::map([("b", 2), ("a", 1)])).unwrap();
            assert_ne!(ab, ba);
        }
    }

    #[test]
    fn test_types_do_not_collide() {
        for fp in both() {
            let int = fp.digest(&ArgValue::Int(1)).unwrap();
            let uint = fp.digest(&ArgValue::UInt(1)).unwrap();
            let string = fp.digest(&ArgValue::from("1")).unwrap();
            let float = fp.digest(&ArgValue::Float(1.0)).unwrap();
            assert_ne!(int, uint);
            assert_ne!(int, string);
            assert_ne!(int, float);
        }
    }

    #[test]
    fn test_isolated_mode_terminates_on_cycles() {
        let first = SharedArg::new(ArgValue::Unit);
        first.set(ArgValue::seq([ArgValue::from(1), ArgValue::Shared(first.clone())]));
        let second = SharedArg::new(ArgValue::Unit);
        second.set(ArgValue::seq([ArgValue::from(1), ArgValue::Shared(second.clone())]));

        let a = isolated().digest(&ArgValue::Shared(first)).unwrap();
        let b = isolated().digest(&ArgValue::Shared(second)).unwrap();

        // Back-references use visit ordinals, not addresses.
        assert_eq!(a, b);
    }

    #[test]
    fn test_shared_mode_rejects_cycles() {
        let cell = SharedArg::new(ArgValue::Unit);
        cell.set(ArgValue::seq([ArgValue::Shared(cell.clone())]));

        let err = shared().digest(&ArgValue::Shared(cell)).unwrap_err();
        assert!(matches!(err, CacheError::Unfingerprintable(_)));
    }

    #[test]
    fn test_shared_mode_follows_shared_cells_by_content() {
        let a = shared().digest(&ArgValue::shared(ArgValue::seq([1, 2]))).unwrap();
        let b = shared().digest(&ArgValue::shared(ArgValue::seq([1, 2]))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_opaque_values_hash_by_identity() {
        let handle = Arc::new(Mutex::new(0_u32));
        let same_a = ArgValue::Opaque(memora_domain::OpaqueArg::from_arc(Arc::clone(&handle)));
        let same_b = ArgValue::Opaque(memora_domain::OpaqueArg::from_arc(handle));
        let other = ArgValue::opaque(Mutex::new(0_u32));

        let fp = isolated();
        assert_eq!(fp.digest(&same_a).unwrap(), fp.digest(&same_b).unwrap());
        assert_ne!(fp.digest(&same_a).unwrap(), fp.digest(&other).unwrap());
    }

    #[test]
    fn test_shared_mode_rejects_nested_opaque_values() {
        let value =
            ArgValue::seq([ArgValue::from(1), ArgValue::seq([ArgValue::opaque(Mutex::new(()))])]);

        let err = shared().digest(&value).unwrap_err();
        assert!(matches!(err, CacheError::Unfingerprintable(msg) if msg.contains("Mutex")));
    }

    #[test]
    fn test_shared_mode_limits_nesting() {
        let mut value = ArgValue::Unit;
        for _ in 0..(MAX_PORTABLE_DEPTH + 10) {
            value = ArgValue::seq([value]);
        }

        assert!(shared().digest(&value).is_err());
        assert!(isolated().digest(&value).is_ok());
    }

    #[test]
    fn test_key_for_ignores_fields() {
        let ignored: BTreeSet<String> = ["request_id".to_string()].into_iter().collect();
        let a = CallArgs::new().arg("x", 5).arg("request_id", "r-1");
        let b = CallArgs::new().arg("x", 5).arg("request_id", "r-2");

        let ka = shared().key_for("f", &a, None, &ignored).unwrap();
        let kb = shared().key_for("f", &b, None, &ignored).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.function_id(), "f");
    }

    #[test]
    fn test_key_for_distinguishes_arguments() {
        let fp = isolated();
        let five = fp.key_for("f", &CallArgs::new().arg("x", 5), None, &no_ignores()).unwrap();
        let ten = fp.key_for("f", &CallArgs::new().arg("x", 10), None, &no_ignores()).unwrap();
        assert_ne!(five, ten);
    }

    #[test]
    fn test_key_fn_result_replaces_arguments() {
        let key_fn: KeyFn = Arc::new(|args: &CallArgs| args.get("id").cloned());
        let a = CallArgs::new().arg("id", 7).arg("noise", 1);
        let b = CallArgs::new().arg("id", 7).arg("noise", 2);

        let ka = shared().key_for("f", &a, Some(&key_fn), &no_ignores()).unwrap();
        let kb = shared().key_for("f", &b, Some(&key_fn), &no_ignores()).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_key_fn_without_result_is_invalid() {
        let key_fn: KeyFn = Arc::new(|_: &CallArgs| None);

        let err =
            isolated().key_for("f", &CallArgs::new(), Some(&key_fn), &no_ignores()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidCacheKey(_)));
    }

    #[test]
    fn test_unencodable_key_fn_result_is_invalid_key() {
        let key_fn: KeyFn = Arc::new(|_: &CallArgs| Some(ArgValue::opaque(Mutex::new(()))));

        let err =
            shared().key_for("f", &CallArgs::new(), Some(&key_fn), &no_ignores()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidCacheKey(_)));
    }

    #[test]
    fn test_nan_payloads_fingerprint_alike() {
        let quiet = ArgValue::Float(f64::NAN);
        let other = ArgValue::Float(f64::from_bits(f64::NAN.to_bits() | 1));
        for fp in both() {
            assert_eq!(fp.digest(&quiet).unwrap(), fp.digest(&other).unwrap());
        }
    }
}
