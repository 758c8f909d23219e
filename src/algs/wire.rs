//! Fixed, versioned, little-endian wire types for the mesh protocols.
//!
//! Fixed-size records (`WireHdr`, `WireCount`) are `bytemuck::Pod` so they
//! can be sent as raw bytes. Variable-length payloads are packed with
//! [`WireWriter`] and read back with [`WireReader`], which bounds-checks every
//! read and reports truncation as `MeshError::Wire`.

use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut, BytesMut};

use crate::data::meta::PartOrdinal;
use crate::mesh_error::MeshError;
use crate::topology::cell_type::Topology;
use crate::topology::entity_key::EntityKey;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Message kinds carried in [`WireHdr::kind`].
pub mod kind {
    pub const KEY_DIRECTORY: u16 = 1;
    pub const KEY_HOLDERS: u16 = 2;
    pub const SIDE_CANDIDATES: u16 = 3;
    pub const SIDE_MATCHES: u16 = 4;
    pub const SHARING_RETRACT: u16 = 5;
    pub const PART_REQUEST: u16 = 6;
    pub const PART_REPLY: u16 = 7;
    pub const GHOST_NOTICE: u16 = 8;
    pub const GHOST_FORWARD: u16 = 9;
    pub const GHOST_RECORDS: u16 = 10;
    pub const VERIFY: u16 = 11;
    pub const REDUCE: u16 = 12;
    pub const REKEY: u16 = 13;
    pub const PART_NOTICE: u16 = 14;
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub count_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16, count: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            count_le: (count as u32).to_le(),
        }
    }

    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }

    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }

    pub fn count(&self) -> usize {
        u32::from_le(self.count_le) as usize
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }

    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// Append-only little-endian packer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// A writer whose payload starts with a header of `kind` and `count`
    /// records.
    pub fn with_header(kind: u16, count: usize) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(cast_slice(std::slice::from_ref(&WireHdr::new(kind, count))));
        Self { buf }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn key(&mut self, k: EntityKey) -> &mut Self {
        self.u64(k.raw())
    }

    /// Count-prefixed list of part ordinals.
    pub fn parts(&mut self, parts: &[PartOrdinal]) -> &mut Self {
        self.u32(parts.len() as u32);
        for p in parts {
            self.u32(p.get());
        }
        self
    }

    /// Count-prefixed list of keys.
    pub fn keys(&mut self, keys: &[EntityKey]) -> &mut Self {
        self.u32(keys.len() as u32);
        for &k in keys {
            self.key(k);
        }
        self
    }

    /// Length-prefixed byte run.
    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.put_u32_le(b.len() as u32);
        self.buf.put_slice(b);
        self
    }

    /// Append bytes that were packed by another writer.
    pub fn raw(&mut self, b: &[u8]) -> &mut Self {
        self.buf.put_slice(b);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Bounds-checked little-endian reader over a received payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Read and validate the header; returns the record count.
    pub fn header(&mut self, expected_kind: u16) -> Result<usize, MeshError> {
        let n = std::mem::size_of::<WireHdr>();
        self.need(n)?;
        let hdr: WireHdr = bytemuck::pod_read_unaligned(&self.buf[..n]);
        self.buf.advance(n);
        if hdr.version() != WIRE_VERSION {
            return Err(MeshError::Wire(format!(
                "wire version {} (expected {WIRE_VERSION})",
                hdr.version()
            )));
        }
        if hdr.kind() != expected_kind {
            return Err(MeshError::Wire(format!(
                "message kind {} (expected {expected_kind})",
                hdr.kind()
            )));
        }
        Ok(hdr.count())
    }

    fn need(&self, n: usize) -> Result<(), MeshError> {
        if self.buf.remaining() >= n {
            Ok(())
        } else {
            Err(MeshError::Wire(format!(
                "truncated payload: need {n} bytes, {} left",
                self.buf.remaining()
            )))
        }
    }

    pub fn u8(&mut self) -> Result<u8, MeshError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, MeshError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, MeshError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, MeshError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn key(&mut self) -> Result<EntityKey, MeshError> {
        EntityKey::from_raw(self.u64()?)
            .map_err(|e| MeshError::Wire(format!("bad entity key: {e}")))
    }

    pub fn parts(&mut self) -> Result<Vec<PartOrdinal>, MeshError> {
        let n = self.u32()? as usize;
        let mut out = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            out.push(PartOrdinal::from_raw(self.u32()?));
        }
        Ok(out)
    }

    pub fn keys(&mut self) -> Result<Vec<EntityKey>, MeshError> {
        let n = self.u32()? as usize;
        let mut out = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            out.push(self.key()?);
        }
        Ok(out)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], MeshError> {
        let n = self.u32()? as usize;
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// One downward relation of a shipped entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WireRelation {
    pub key: EntityKey,
    pub ordinal: u16,
    pub permutation: u8,
}

/// Full state of an entity as shipped to a ghost receiver:
/// `{key, owner, topology, parts, relations, field payload}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub owner: u32,
    pub topology: Topology,
    /// Application parts only; receivers add their own bookkeeping parts.
    pub parts: Vec<PartOrdinal>,
    pub relations: Vec<WireRelation>,
    /// Opaque bytes from the field-data observers.
    pub fields: Vec<u8>,
}

impl EntityRecord {
    pub fn pack(&self, w: &mut WireWriter) {
        w.key(self.key)
            .u32(self.owner)
            .u8(self.topology.to_wire())
            .parts(&self.parts);
        w.u32(self.relations.len() as u32);
        for r in &self.relations {
            w.key(r.key).u16(r.ordinal).u8(r.permutation);
        }
        w.bytes(&self.fields);
    }

    pub fn unpack(r: &mut WireReader<'_>) -> Result<Self, MeshError> {
        let key = r.key()?;
        let owner = r.u32()?;
        let topology = Topology::from_wire(r.u8()?)?;
        let parts = r.parts()?;
        let nr = r.u32()? as usize;
        let mut relations = Vec::with_capacity(nr.min(256));
        for _ in 0..nr {
            relations.push(WireRelation {
                key: r.key()?,
                ordinal: r.u16()?,
                permutation: r.u8()?,
            });
        }
        let fields = r.bytes()?.to_vec();
        Ok(Self {
            key,
            owner,
            topology,
            parts,
            relations,
            fields,
        })
    }
}
