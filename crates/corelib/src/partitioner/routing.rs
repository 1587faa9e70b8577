//! Object id to shard routing.
//!
//! Producers publish each work item to the queue of the shard derived from
//! the item's id, so all updates for one object go through one queue and,
//! while ownership is stable, one consumer in publish order. Items a
//! departing owner had received but not processed are requeued behind
//! newer ones.

use super::TOTAL_SHARDS;
use crate::error::{Error, Result};
use crate::vnode::ShardNumber;

/// Map an object id (UUID-shaped hex, dashes optional) to its shard.
///
/// The id is read as a hexadecimal integer and reduced modulo
/// [`TOTAL_SHARDS`]. Since `TOTAL_SHARDS` is a power of two only the trailing
/// digits matter, so ids longer than 128 bits are accepted.
///
/// # Example
///
/// ```rust
/// use corelib::shard_for_object;
///
/// let shard = shard_for_object("00000000-1111-2222-3333-444444444444").unwrap();
/// assert_eq!(shard.get(), 68);
/// assert_eq!(shard.owner_queue(), "vnode-68");
/// ```
pub fn shard_for_object(object_id: &str) -> Result<ShardNumber> {
    let digits: String = object_id.chars().filter(|c| *c != '-').collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidShard(format!(
            "object id {:?} is not a hex identifier",
            object_id
        )));
    }

    // 32 hex digits fit in a u128.
    let tail = &digits[digits.len().saturating_sub(32)..];
    let value = u128::from_str_radix(tail, 16)
        .map_err(|e| Error::InvalidShard(format!("object id {:?}: {}", object_id, e)))?;

    Ok(ShardNumber::from_raw((value % TOTAL_SHARDS as u128) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_object_routes_to_68() {
        let shard = shard_for_object("00000000-1111-2222-3333-444444444444").unwrap();
        assert_eq!(shard.get(), 68);
    }

    #[test]
    fn test_dashes_are_optional() {
        let a = shard_for_object("0000000-1111-2222-3333-444444444444").unwrap();
        let b = shard_for_object("0000000111122223333444444444444").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_long_ids_use_trailing_digits() {
        let long = format!("ff{}", "0".repeat(40));
        assert_eq!(shard_for_object(&long).unwrap().get(), 0);
    }

    #[test]
    fn test_rejects_non_hex() {
        assert!(matches!(
            shard_for_object("not-a-uuid"),
            Err(Error::InvalidShard(_))
        ));
        assert!(shard_for_object("").is_err());
        assert!(shard_for_object("---").is_err());
    }
}
