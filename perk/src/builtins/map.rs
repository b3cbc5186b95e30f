//! Persistent hash map: an 8-way hash-array-mapped trie over 32-bit key
//! hashes. Nodes keep inline key/value pairs (`datamap`) and child nodes
//! (`nodemap`); assoc path-copies from the root. Two distinct keys with
//! identical 32-bit hashes are a hard error rather than a collision chain.

use heap::{Allocator, HeapError};
use object::{Header, ObjectKind, Slot};

use crate::ast::Apply;
use crate::fiber::Fiber;
use crate::frame::Frame;
use crate::objects::{alloc_fixed, alloc_with_tail, eq_key, hash_key, Map, MapNode};

const BITS: u32 = 3;
const WIDTH: u32 = 1 << BITS; // 8-way branching
const MASK: u32 = WIDTH - 1;
const MAX_SHIFT: u32 = 30;

#[derive(Debug)]
pub enum MapError {
    Alloc(HeapError),
    BadKey,
    HashCollision,
}

impl From<HeapError> for MapError {
    fn from(e: HeapError) -> Self {
        Self::Alloc(e)
    }
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "{e}"),
            Self::BadKey => write!(f, "value is not usable as a map key"),
            Self::HashCollision => {
                write!(f, "32-bit hash collision at maximum trie depth")
            }
        }
    }
}

pub fn empty(alloc: &Allocator, shared: bool) -> Result<Slot, HeapError> {
    let r = alloc_fixed(
        alloc,
        shared,
        false,
        Map {
            header: Header::new(ObjectKind::Map),
            count: 0,
            root: Slot::Undef,
        },
    )?;
    Ok(Slot::Ref(r))
}

fn as_map<'a>(slot: Slot) -> Option<&'a Map> {
    let r = slot.as_ref()?;
    if r.kind() != ObjectKind::Map {
        return None;
    }
    // SAFETY: kind checked; maps are immutable after construction.
    Some(unsafe { &*(r.as_ptr() as *const Map) })
}

fn as_node<'a>(slot: Slot) -> &'a MapNode {
    let r = slot.as_ref().expect("map child is a node");
    debug_assert_eq!(r.kind(), ObjectKind::MapNode);
    // SAFETY: trie children are always map nodes.
    unsafe { &*(r.as_ptr() as *const MapNode) }
}

/// Build a node from its maps and element slots.
fn new_node(
    alloc: &Allocator,
    shared: bool,
    datamap: u8,
    nodemap: u8,
    elems: &[Slot],
) -> Result<Slot, HeapError> {
    debug_assert_eq!(
        elems.len(),
        (datamap.count_ones() * 2 + nodemap.count_ones()) as usize
    );
    let r = alloc_with_tail(
        alloc,
        shared,
        elems.len() * size_of::<Slot>(),
        MapNode {
            header: Header::new(ObjectKind::MapNode),
            datamap,
            nodemap,
            _pad: [0; 6],
        },
    )?;
    // SAFETY: tail area sized above.
    unsafe { r.cast_mut::<MapNode>() }
        .entries_mut()
        .copy_from_slice(elems);
    Ok(Slot::Ref(r))
}

#[inline(always)]
fn pair_index(datamap: u8, bit: u8) -> usize {
    (datamap & (bit - 1)).count_ones() as usize
}

#[inline(always)]
fn node_index(datamap: u8, nodemap: u8, bit: u8) -> usize {
    datamap.count_ones() as usize * 2 + (nodemap & (bit - 1)).count_ones() as usize
}

pub fn count(map: Slot) -> Option<u64> {
    as_map(map).map(|m| m.count)
}

pub fn get(map: Slot, key: Slot) -> Result<Option<Slot>, MapError> {
    let map = as_map(map).ok_or(MapError::BadKey)?;
    let hash = hash_key(key).ok_or(MapError::BadKey)?;
    if !map.root.is_ref() {
        return Ok(None);
    }
    let mut node = as_node(map.root);
    let mut shift = 0u32;
    loop {
        let bit = 1u8 << ((hash >> shift) & MASK);
        if node.datamap & bit != 0 {
            let pos = pair_index(node.datamap, bit);
            let entries = node.entries();
            let k = entries[2 * pos];
            return Ok(if eq_key(k, key) {
                Some(entries[2 * pos + 1])
            } else {
                None
            });
        }
        if node.nodemap & bit != 0 {
            let pos = node_index(node.datamap, node.nodemap, bit);
            node = as_node(node.entries()[pos]);
            shift += BITS;
            continue;
        }
        return Ok(None);
    }
}

pub fn contains(map: Slot, key: Slot) -> Result<bool, MapError> {
    Ok(get(map, key)?.is_some())
}

pub fn assoc(
    alloc: &Allocator,
    map: Slot,
    key: Slot,
    value: Slot,
    shared: bool,
) -> Result<Slot, MapError> {
    let m = as_map(map).ok_or(MapError::BadKey)?;
    let hash = hash_key(key).ok_or(MapError::BadKey)?;

    let (new_root, added) = if m.root.is_ref() {
        node_assoc(alloc, shared, m.root, 0, hash, key, value)?
    } else {
        // fresh single-pair root
        let bit = 1u8 << (hash & MASK);
        (new_node(alloc, shared, bit, 0, &[key, value])?, true)
    };

    let r = alloc_fixed(
        alloc,
        shared,
        false,
        Map {
            header: Header::new(ObjectKind::Map),
            count: m.count + added as u64,
            root: new_root,
        },
    )?;
    Ok(Slot::Ref(r))
}

fn node_assoc(
    alloc: &Allocator,
    shared: bool,
    node_slot: Slot,
    shift: u32,
    hash: u32,
    key: Slot,
    value: Slot,
) -> Result<(Slot, bool), MapError> {
    let node = as_node(node_slot);
    let bit = 1u8 << ((hash >> shift) & MASK);
    let entries = node.entries();

    if node.datamap & bit != 0 {
        let pos = pair_index(node.datamap, bit);
        let existing_key = entries[2 * pos];
        if eq_key(existing_key, key) {
            // replace in place (copy with the new value)
            let mut elems = entries.to_vec();
            elems[2 * pos + 1] = value;
            let n = new_node(alloc, shared, node.datamap, node.nodemap, &elems)?;
            return Ok((n, false));
        }
        // push the colliding pair down one level
        let existing_hash = hash_key(existing_key).ok_or(MapError::BadKey)?;
        if existing_hash == hash {
            return Err(MapError::HashCollision);
        }
        if shift >= MAX_SHIFT {
            return Err(MapError::HashCollision);
        }
        let child = make_subtree(
            alloc,
            shared,
            shift + BITS,
            existing_hash,
            existing_key,
            entries[2 * pos + 1],
            hash,
            key,
            value,
        )?;
        // the position moves from the pair area to the child area
        let mut elems = Vec::with_capacity(entries.len() - 1);
        elems.extend_from_slice(&entries[..2 * pos]);
        elems.extend_from_slice(&entries[2 * pos + 2..]);
        let datamap = node.datamap & !bit;
        let nodemap = node.nodemap | bit;
        let insert_at = node_index(datamap, nodemap, bit);
        elems.insert(insert_at, child);
        let n = new_node(alloc, shared, datamap, nodemap, &elems)?;
        return Ok((n, true));
    }

    if node.nodemap & bit != 0 {
        let pos = node_index(node.datamap, node.nodemap, bit);
        let (child, added) =
            node_assoc(alloc, shared, entries[pos], shift + BITS, hash, key, value)?;
        let mut elems = entries.to_vec();
        elems[pos] = child;
        let n = new_node(alloc, shared, node.datamap, node.nodemap, &elems)?;
        return Ok((n, added));
    }

    // insert a fresh pair
    let pos = pair_index(node.datamap, bit);
    let mut elems = Vec::with_capacity(entries.len() + 2);
    elems.extend_from_slice(&entries[..2 * pos]);
    elems.push(key);
    elems.push(value);
    elems.extend_from_slice(&entries[2 * pos..]);
    let n = new_node(alloc, shared, node.datamap | bit, node.nodemap, &elems)?;
    Ok((n, true))
}

/// Create the (possibly nested) subtree holding two pairs whose hashes
/// first diverge at or below `shift`.
#[allow(clippy::too_many_arguments)]
fn make_subtree(
    alloc: &Allocator,
    shared: bool,
    shift: u32,
    hash_a: u32,
    key_a: Slot,
    value_a: Slot,
    hash_b: u32,
    key_b: Slot,
    value_b: Slot,
) -> Result<Slot, MapError> {
    if shift > MAX_SHIFT {
        return Err(MapError::HashCollision);
    }
    let idx_a = (hash_a >> shift) & MASK;
    let idx_b = (hash_b >> shift) & MASK;
    if idx_a == idx_b {
        let child = make_subtree(
            alloc, shared, shift + BITS, hash_a, key_a, value_a, hash_b, key_b, value_b,
        )?;
        let bit = 1u8 << idx_a;
        return Ok(new_node(alloc, shared, 0, bit, &[child])?);
    }
    let bit_a = 1u8 << idx_a;
    let bit_b = 1u8 << idx_b;
    let elems = if idx_a < idx_b {
        [key_a, value_a, key_b, value_b]
    } else {
        [key_b, value_b, key_a, value_a]
    };
    Ok(new_node(alloc, shared, bit_a | bit_b, 0, &elems)?)
}

// ── builtin methods ───────────────────────────────────────────────────

pub extern "C" fn bi_get(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().get;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(2) {
        return code;
    }
    if as_map(frame.arg(1)).is_none() {
        return frame.bad_dispatch();
    }
    match get(frame.arg(1), frame.arg(2)) {
        Ok(Some(value)) => frame.result(value),
        Ok(None) => frame.raise("key-not-found", "key not found in map"),
        Err(e) => frame.raise("bad-argument", &e.to_string()),
    }
}

pub extern "C" fn bi_contains(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().contains;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(2) {
        return code;
    }
    if as_map(frame.arg(1)).is_none() {
        return frame.bad_dispatch();
    }
    match contains(frame.arg(1), frame.arg(2)) {
        Ok(found) => frame.result(Slot::Bool(found)),
        Err(e) => frame.raise("bad-argument", &e.to_string()),
    }
}

pub extern "C" fn bi_assoc(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().assoc;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(3) {
        return code;
    }
    if as_map(frame.arg(1)).is_none() {
        return frame.bad_dispatch();
    }
    let alloc = frame.fbr.allocator();
    match assoc(alloc, frame.arg(1), frame.arg(2), frame.arg(3), false) {
        Ok(map) => frame.result(map),
        Err(MapError::Alloc(_)) => frame.raise("allocation-failed", "out of memory"),
        Err(e) => frame.raise("bad-argument", &e.to_string()),
    }
}

pub extern "C" fn bi_length(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().length;
    if !frame.matches_static(expected) || frame.argc() != 1 {
        return frame.bad_dispatch();
    }
    match count(frame.arg(1)) {
        Some(n) => frame.result(Slot::Int(n as i64)),
        None => frame.bad_dispatch(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::new_str;
    use crate::runtime::test_allocator;

    #[test]
    fn assoc_get_roundtrip() {
        let alloc = test_allocator();
        let mut map = empty(&alloc, false).unwrap();
        for i in 0..2000i64 {
            map = assoc(&alloc, map, Slot::Int(i), Slot::Int(i * 10), false).unwrap();
        }
        assert_eq!(count(map), Some(2000));
        for i in 0..2000i64 {
            let v = get(map, Slot::Int(i)).unwrap();
            assert_eq!(v.and_then(|s| s.as_int()), Some(i * 10));
        }
        assert!(get(map, Slot::Int(2000)).unwrap().is_none());
    }

    #[test]
    fn assoc_replaces_existing() {
        let alloc = test_allocator();
        let mut map = empty(&alloc, false).unwrap();
        map = assoc(&alloc, map, Slot::Int(1), Slot::Int(10), false).unwrap();
        let updated = assoc(&alloc, map, Slot::Int(1), Slot::Int(20), false).unwrap();
        assert_eq!(count(updated), Some(1));
        assert_eq!(
            get(updated, Slot::Int(1)).unwrap().and_then(|s| s.as_int()),
            Some(20)
        );
        // the original is untouched
        assert_eq!(
            get(map, Slot::Int(1)).unwrap().and_then(|s| s.as_int()),
            Some(10)
        );
    }

    #[test]
    fn string_keys() {
        let alloc = test_allocator();
        let mut map = empty(&alloc, false).unwrap();
        let k1 = new_str(&alloc, "alpha", false).unwrap();
        let k2 = new_str(&alloc, "beta", false).unwrap();
        map = assoc(&alloc, map, k1, Slot::Int(1), false).unwrap();
        map = assoc(&alloc, map, k2, Slot::Int(2), false).unwrap();
        let probe = new_str(&alloc, "alpha", false).unwrap();
        assert_eq!(
            get(map, probe).unwrap().and_then(|s| s.as_int()),
            Some(1)
        );
        assert!(contains(map, k2).unwrap());
    }

    #[test]
    fn unhashable_key_is_rejected() {
        let alloc = test_allocator();
        let map = empty(&alloc, false).unwrap();
        assert!(matches!(
            assoc(&alloc, map, Slot::Undef, Slot::Int(1), false),
            Err(MapError::BadKey)
        ));
    }
}
