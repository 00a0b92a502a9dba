//! Describing data
//!
//! Messages carry composite configuration records between processes that
//! share one binary image, so the wire format of a record is derived from
//! its memory layout: a [`UserDatatype`] is an ordered list of blocks, each
//! naming a primitive type, a byte offset and a repetition count.
//!
//! Descriptors for primitive types come from the [`Equivalence`] trait.
//! Composite records either implement it by hand with
//! [`UserDatatype::structured`] or use `#[derive(Equivalence)]`, which reads
//! the field offsets with `memoffset::offset_of!`. Nested records are turned
//! into their own descriptor first and then flattened into the parent.
//!
//! Only the bytes covered by blocks travel; padding never leaves the sender.

use std::any::{type_name, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem::size_of;
use std::{ptr, slice};

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::Count;

/// Datatype traits
pub mod traits {
    pub use super::Equivalence;
    pub use swmpi_derive::Equivalence;
}

/// Primitive element types a block can be made of.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// `i8`
    I8,
    /// `i16`
    I16,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `u8`
    U8,
    /// `u16`
    U16,
    /// `u32`
    U32,
    /// `u64`
    U64,
    /// `f32`
    F32,
    /// `f64`
    F64,
}

impl Primitive {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            Primitive::I8 | Primitive::U8 => 1,
            Primitive::I16 | Primitive::U16 => 2,
            Primitive::I32 | Primitive::U32 | Primitive::F32 => 4,
            Primitive::I64 | Primitive::U64 | Primitive::F64 => 8,
        }
    }
}

/// A run of `count` contiguous primitives starting `offset` bytes into an element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Element type of the run
    pub primitive: Primitive,
    /// Byte offset from the start of the described value
    pub offset: usize,
    /// Number of primitives in the run
    pub count: Count,
}

impl Block {
    fn len(&self) -> usize {
        self.primitive.size() * self.count
    }

    fn end(&self) -> usize {
        self.offset + self.len()
    }
}

/// A member of a composite record: `count` values of `datatype` at `offset`.
///
/// Consumed by [`UserDatatype::structured`]; the member descriptor is
/// released once it has been flattened into the parent.
#[derive(Clone, Debug)]
pub struct Field {
    offset: usize,
    count: Count,
    datatype: UserDatatype,
}

impl Field {
    /// Describe a member at byte `offset` holding `count` values of `datatype`.
    pub fn new(offset: usize, count: Count, datatype: UserDatatype) -> Field {
        Field {
            offset,
            count,
            datatype,
        }
    }
}

/// A wire-format descriptor bound to one Rust type.
#[derive(Clone, Debug)]
pub struct UserDatatype {
    name: &'static str,
    type_id: TypeId,
    extent: usize,
    signature: u64,
    blocks: SmallVec<[Block; 4]>,
}

impl UserDatatype {
    /// Descriptor for a primitive Rust type.
    fn system<T: 'static>(primitive: Primitive) -> UserDatatype {
        debug_assert_eq!(size_of::<T>(), primitive.size());
        let mut blocks = SmallVec::new();
        blocks.push(Block {
            primitive,
            offset: 0,
            count: 1,
        });
        UserDatatype::with_blocks::<T>(blocks)
    }

    /// Descriptor of `A`, a contiguous repetition of `count` values of `oldtype`.
    ///
    /// `A` must be exactly `count` elements of `oldtype` wide, e.g. `[T; count]`.
    ///
    /// # Safety
    ///
    /// `A` must consist of `count` consecutive values of the type `oldtype`
    /// describes. Received messages are written into `A` through the result.
    pub unsafe fn contiguous<A: 'static>(count: Count, oldtype: &UserDatatype) -> Result<UserDatatype> {
        if count * oldtype.extent != size_of::<A>() {
            return Err(Error::Datatype {
                type_name: type_name::<A>(),
                reason: format!(
                    "{} elements of `{}` span {} bytes, the type has {}",
                    count,
                    oldtype.name,
                    count * oldtype.extent,
                    size_of::<A>()
                ),
            });
        }
        let mut blocks = SmallVec::new();
        for i in 0..count {
            for block in &oldtype.blocks {
                push_merged(&mut blocks, shifted(block, i * oldtype.extent));
            }
        }
        Ok(UserDatatype::with_blocks::<A>(blocks))
    }

    /// Descriptor of the composite `S` built from its member fields.
    ///
    /// Members must lie within `S` and must not overlap. Adjacent runs of the
    /// same primitive are merged.
    ///
    /// # Safety
    ///
    /// Every field must name a member of `S` at that offset which holds
    /// initialized values of the type its descriptor describes, and any value
    /// of that type must be a valid value of the member. Received messages
    /// are written into `S` through the result, and sent ones are read from it.
    ///
    /// Leaving out the `unsafe` block does not compile:
    ///
    /// ```compile_fail
    /// use std::num::NonZeroU32;
    /// use swmpi::datatype::{Equivalence, Field, UserDatatype};
    ///
    /// let datatype = UserDatatype::structured::<NonZeroU32>(vec![
    ///     Field::new(0, 1, u32::equivalent_datatype()?),
    /// ])?;
    /// # Ok::<(), swmpi::Error>(())
    /// ```
    pub unsafe fn structured<S: 'static>(mut fields: Vec<Field>) -> Result<UserDatatype> {
        let invalid = |reason: String| Error::Datatype {
            type_name: type_name::<S>(),
            reason,
        };

        fields.sort_by_key(|field| field.offset);

        let mut blocks = SmallVec::new();
        let mut covered = 0;
        for field in fields {
            let span = field.count * field.datatype.extent;
            if field.offset < covered {
                return Err(invalid(format!(
                    "member of type `{}` at offset {} overlaps the previous member",
                    field.datatype.name, field.offset
                )));
            }
            if field.offset + span > size_of::<S>() {
                return Err(invalid(format!(
                    "member of type `{}` at offset {} ends past the record size {}",
                    field.datatype.name,
                    field.offset,
                    size_of::<S>()
                )));
            }
            for i in 0..field.count {
                for block in &field.datatype.blocks {
                    push_merged(
                        &mut blocks,
                        shifted(block, field.offset + i * field.datatype.extent),
                    );
                }
            }
            covered = field.offset + span;
        }

        Ok(UserDatatype::with_blocks::<S>(blocks))
    }

    fn with_blocks<T: 'static>(blocks: SmallVec<[Block; 4]>) -> UserDatatype {
        let mut hasher = DefaultHasher::new();
        for block in &blocks {
            block.primitive.hash(&mut hasher);
            block.count.hash(&mut hasher);
        }
        UserDatatype {
            name: type_name::<T>(),
            type_id: TypeId::of::<T>(),
            extent: size_of::<T>(),
            signature: hasher.finish(),
            blocks,
        }
    }

    /// Name of the described Rust type
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Distance in bytes between consecutive values
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Bytes that travel per value
    pub fn packed_size(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    /// Blocks in increasing offset order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Hash of the primitive sequence, compared between sender and receiver.
    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// Whether this descriptor was built for `T`
    pub fn describes<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub(crate) fn check_buffer<T: 'static>(&self, len: usize, count: Count) -> Result<()> {
        if !self.describes::<T>() {
            return Err(Error::DatatypeMismatch {
                descriptor: self.name,
                buffer: type_name::<T>(),
            });
        }
        if count > len {
            return Err(Error::CountOutOfRange { count, len });
        }
        Ok(())
    }

    /// Copy the described bytes of the first `count` values of `buf`.
    pub fn pack<T: 'static>(&self, buf: &[T], count: Count) -> Result<Vec<u8>> {
        self.check_buffer::<T>(buf.len(), count)?;
        let mut bytes = Vec::with_capacity(count * self.packed_size());
        for value in &buf[..count] {
            let base = (value as *const T).cast::<u8>();
            for block in &self.blocks {
                // SAFETY: the descriptor was built for `T`, every block lies
                // within `size_of::<T>()` and covers initialized members only.
                let run = unsafe { slice::from_raw_parts(base.add(block.offset), block.len()) };
                bytes.extend_from_slice(run);
            }
        }
        Ok(bytes)
    }

    /// Write `count` packed values from `bytes` into the start of `buf`.
    pub fn unpack<T: 'static>(&self, bytes: &[u8], buf: &mut [T], count: Count) -> Result<()> {
        self.check_buffer::<T>(buf.len(), count)?;
        if bytes.len() != count * self.packed_size() {
            return Err(Error::Truncated {
                capacity: count * self.packed_size(),
                received: bytes.len(),
            });
        }
        let mut pos = 0;
        for value in &mut buf[..count] {
            let base = (value as *mut T).cast::<u8>();
            for block in &self.blocks {
                // SAFETY: as in `pack`; every primitive accepts any bit pattern.
                unsafe {
                    ptr::copy_nonoverlapping(
                        bytes.as_ptr().add(pos),
                        base.add(block.offset),
                        block.len(),
                    );
                }
                pos += block.len();
            }
        }
        Ok(())
    }
}

fn shifted(block: &Block, by: usize) -> Block {
    Block {
        offset: block.offset + by,
        ..*block
    }
}

fn push_merged(blocks: &mut SmallVec<[Block; 4]>, block: Block) {
    if let Some(last) = blocks.last_mut() {
        if last.primitive == block.primitive && last.end() == block.offset {
            last.count += block.count;
            return;
        }
    }
    blocks.push(block);
}

/// A Rust type whose values can travel in messages.
///
/// # Safety
///
/// The returned descriptor must only cover bytes of `Self` that hold
/// initialized values of the named primitives, and every bit pattern written
/// into those bytes must leave a valid `Self`.
pub unsafe trait Equivalence: 'static + Sized {
    /// The wire format of `Self`
    fn equivalent_datatype() -> Result<UserDatatype>;
}

macro_rules! equivalent_system_datatype {
    ($rstype:ty, $primitive:expr) => {
        unsafe impl Equivalence for $rstype {
            fn equivalent_datatype() -> Result<UserDatatype> {
                Ok(UserDatatype::system::<$rstype>($primitive))
            }
        }
    };
}

equivalent_system_datatype!(f32, Primitive::F32);
equivalent_system_datatype!(f64, Primitive::F64);

equivalent_system_datatype!(i8, Primitive::I8);
equivalent_system_datatype!(i16, Primitive::I16);
equivalent_system_datatype!(i32, Primitive::I32);
equivalent_system_datatype!(i64, Primitive::I64);

equivalent_system_datatype!(u8, Primitive::U8);
equivalent_system_datatype!(u16, Primitive::U16);
equivalent_system_datatype!(u32, Primitive::U32);
equivalent_system_datatype!(u64, Primitive::U64);

#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(usize, Primitive::U32);
#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(isize, Primitive::I32);

#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(usize, Primitive::U64);
#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(isize, Primitive::I64);

unsafe impl<T, const N: usize> Equivalence for [T; N]
where
    T: Equivalence,
{
    fn equivalent_datatype() -> Result<UserDatatype> {
        // SAFETY: `[T; N]` is `N` consecutive values of `T`.
        unsafe { UserDatatype::contiguous::<[T; N]>(N, &T::equivalent_datatype()?) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[repr(C)]
    #[derive(Default, Debug, PartialEq, Clone, Copy)]
    struct Cover {
        fraction: f64,
        albedo: f64,
    }

    unsafe impl Equivalence for Cover {
        fn equivalent_datatype() -> Result<UserDatatype> {
            let fields = vec![
                Field::new(offset_of!(Cover, fraction), 1, f64::equivalent_datatype()?),
                Field::new(offset_of!(Cover, albedo), 1, f64::equivalent_datatype()?),
            ];
            unsafe { UserDatatype::structured::<Cover>(fields) }
        }
    }

    #[repr(C)]
    #[derive(Default, Debug, PartialEq, Clone, Copy)]
    struct Padded {
        flag: u8,
        value: u64,
        covers: [Cover; 2],
    }

    unsafe impl Equivalence for Padded {
        fn equivalent_datatype() -> Result<UserDatatype> {
            let fields = vec![
                Field::new(offset_of!(Padded, flag), 1, u8::equivalent_datatype()?),
                Field::new(offset_of!(Padded, value), 1, u64::equivalent_datatype()?),
                Field::new(offset_of!(Padded, covers), 2, Cover::equivalent_datatype()?),
            ];
            unsafe { UserDatatype::structured::<Padded>(fields) }
        }
    }

    #[test]
    fn adjacent_runs_are_merged() {
        let datatype = Cover::equivalent_datatype().unwrap();
        assert_eq!(
            datatype.blocks(),
            &[Block {
                primitive: Primitive::F64,
                offset: 0,
                count: 2
            }]
        );
        assert_eq!(datatype.packed_size(), 16);
    }

    #[test]
    fn nested_records_are_flattened() {
        let datatype = Padded::equivalent_datatype().unwrap();
        assert_eq!(datatype.extent(), size_of::<Padded>());
        assert_eq!(
            datatype.blocks(),
            &[
                Block {
                    primitive: Primitive::U8,
                    offset: 0,
                    count: 1
                },
                Block {
                    primitive: Primitive::U64,
                    offset: 8,
                    count: 1
                },
                Block {
                    primitive: Primitive::F64,
                    offset: 16,
                    count: 4
                },
            ]
        );
        // padding after `flag` does not travel
        assert_eq!(datatype.packed_size(), 1 + 8 + 32);
    }

    #[test]
    fn pack_skips_padding_and_unpack_restores_values() {
        let datatype = Padded::equivalent_datatype().unwrap();
        let sent = [
            Padded {
                flag: 7,
                value: 1 << 40,
                covers: [
                    Cover {
                        fraction: 0.25,
                        albedo: 0.1,
                    },
                    Cover {
                        fraction: 0.75,
                        albedo: 0.2,
                    },
                ],
            },
            Padded::default(),
        ];
        let bytes = datatype.pack(&sent, 2).unwrap();
        assert_eq!(bytes.len(), 2 * datatype.packed_size());

        let mut received = [Padded::default(); 3];
        datatype.unpack(&bytes, &mut received, 2).unwrap();
        assert_eq!(&received[..2], &sent[..]);
    }

    #[test]
    fn arrays_are_contiguous_repetitions() {
        let datatype = <[[i32; 3]; 2]>::equivalent_datatype().unwrap();
        assert_eq!(datatype.blocks().len(), 1);
        assert_eq!(datatype.blocks()[0].count, 6);
        assert!(datatype.describes::<[[i32; 3]; 2]>());
        assert!(!datatype.describes::<[i32; 6]>());
    }

    #[test]
    fn overlapping_members_are_rejected() {
        let fields = vec![
            Field::new(0, 1, f64::equivalent_datatype().unwrap()),
            Field::new(4, 1, f64::equivalent_datatype().unwrap()),
        ];
        let result = unsafe { UserDatatype::structured::<Cover>(fields) };
        assert!(matches!(result, Err(Error::Datatype { .. })));
    }

    #[test]
    fn members_past_the_end_are_rejected() {
        let fields = vec![Field::new(0, 3, f64::equivalent_datatype().unwrap())];
        let result = unsafe { UserDatatype::structured::<Cover>(fields) };
        assert!(matches!(result, Err(Error::Datatype { .. })));
    }

    #[test]
    fn wrong_buffer_type_is_a_mismatch() {
        let datatype = f64::equivalent_datatype().unwrap();
        let result = datatype.pack(&[1u64, 2], 2);
        assert!(matches!(result, Err(Error::DatatypeMismatch { .. })));
        let result = datatype.pack(&[1.0f64], 2);
        assert!(matches!(result, Err(Error::CountOutOfRange { .. })));
    }

    #[test]
    fn signatures_follow_primitive_sequence() {
        let pair = Cover::equivalent_datatype().unwrap();
        let array = <[f64; 2]>::equivalent_datatype().unwrap();
        let single = f64::equivalent_datatype().unwrap();
        assert_eq!(pair.signature(), array.signature());
        assert_ne!(pair.signature(), single.signature());
    }
}
