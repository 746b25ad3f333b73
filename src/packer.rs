use std::fmt;

/// Argument packing for the binary record format.
///
/// Every argument type has a static [`ArgType`] tag. A call site's tags are
/// recorded once in the dictionary, so the packed payload itself is just the
/// values back to back: fixed-size types at their native width in
/// little-endian order, text and blobs as a `u32` length followed by the
/// bytes.

/// Type tag for one packed argument, as stored in the dictionary.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    I8 = 1,
    I16 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U16 = 6,
    U32 = 7,
    U64 = 8,
    F32 = 9,
    F64 = 10,
    Bool = 11,
    Char = 12,
    Str = 13,
    Bytes = 14,
    Pointer = 15,
}

impl ArgType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => ArgType::I8,
            2 => ArgType::I16,
            3 => ArgType::I32,
            4 => ArgType::I64,
            5 => ArgType::U8,
            6 => ArgType::U16,
            7 => ArgType::U32,
            8 => ArgType::U64,
            9 => ArgType::F32,
            10 => ArgType::F64,
            11 => ArgType::Bool,
            12 => ArgType::Char,
            13 => ArgType::Str,
            14 => ArgType::Bytes,
            15 => ArgType::Pointer,
            _ => return None,
        })
    }

    /// Packed width for fixed-size types, `None` for length-prefixed ones.
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            ArgType::I8 | ArgType::U8 | ArgType::Bool => Some(1),
            ArgType::I16 | ArgType::U16 => Some(2),
            ArgType::I32 | ArgType::U32 | ArgType::F32 | ArgType::Char => Some(4),
            ArgType::I64 | ArgType::U64 | ArgType::F64 | ArgType::Pointer => Some(8),
            ArgType::Str | ArgType::Bytes => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ArgType::I8 => "i8",
            ArgType::I16 => "i16",
            ArgType::I32 => "i32",
            ArgType::I64 => "i64",
            ArgType::U8 => "u8",
            ArgType::U16 => "u16",
            ArgType::U32 => "u32",
            ArgType::U64 => "u64",
            ArgType::F32 => "f32",
            ArgType::F64 => "f64",
            ArgType::Bool => "bool",
            ArgType::Char => "char",
            ArgType::Str => "str",
            ArgType::Bytes => "bytes",
            ArgType::Pointer => "ptr",
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value that can be written into a log record without formatting it.
///
/// The tag is an associated constant, so a call site's signature is fixed at
/// compile time and packing compiles down to a handful of copies.
pub trait Loggable {
    const ARG_TYPE: ArgType;

    /// Number of bytes `pack` will write.
    fn packed_len(&self) -> usize;

    /// Writes the value at the start of `out`, returns bytes written.
    /// `out` must hold at least `packed_len()` bytes.
    fn pack(&self, out: &mut [u8]) -> usize;
}

macro_rules! impl_loggable_fixed {
    ($($ty:ty => $tag:ident),* $(,)?) => {$(
        impl Loggable for $ty {
            const ARG_TYPE: ArgType = ArgType::$tag;

            #[inline(always)]
            fn packed_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            #[inline(always)]
            fn pack(&self, out: &mut [u8]) -> usize {
                let bytes = self.to_le_bytes();
                out[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
        }
    )*};
}

impl_loggable_fixed! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

impl Loggable for isize {
    const ARG_TYPE: ArgType = ArgType::I64;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        8
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        (*self as i64).pack(out)
    }
}

impl Loggable for usize {
    const ARG_TYPE: ArgType = ArgType::U64;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        8
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        (*self as u64).pack(out)
    }
}

impl Loggable for bool {
    const ARG_TYPE: ArgType = ArgType::Bool;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        1
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        out[0] = *self as u8;
        1
    }
}

impl Loggable for char {
    const ARG_TYPE: ArgType = ArgType::Char;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        4
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        (*self as u32).pack(out)
    }
}

#[inline(always)]
fn pack_run(bytes: &[u8], out: &mut [u8]) -> usize {
    let len = bytes.len();
    out[..4].copy_from_slice(&(len as u32).to_le_bytes());
    out[4..4 + len].copy_from_slice(bytes);
    4 + len
}

impl Loggable for str {
    const ARG_TYPE: ArgType = ArgType::Str;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        4 + self.len()
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        pack_run(self.as_bytes(), out)
    }
}

impl Loggable for String {
    const ARG_TYPE: ArgType = ArgType::Str;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        self.as_str().packed_len()
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        self.as_str().pack(out)
    }
}

impl Loggable for [u8] {
    const ARG_TYPE: ArgType = ArgType::Bytes;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        4 + self.len()
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        pack_run(self, out)
    }
}

impl<T: ?Sized> Loggable for *const T {
    const ARG_TYPE: ArgType = ArgType::Pointer;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        8
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        (self.cast::<()>() as usize as u64).pack(out)
    }
}

impl<T: ?Sized> Loggable for *mut T {
    const ARG_TYPE: ArgType = ArgType::Pointer;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        8
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        (self.cast::<()>() as usize as u64).pack(out)
    }
}

impl<T: Loggable + ?Sized> Loggable for &T {
    const ARG_TYPE: ArgType = T::ARG_TYPE;

    #[inline(always)]
    fn packed_len(&self) -> usize {
        (**self).packed_len()
    }

    #[inline(always)]
    fn pack(&self, out: &mut [u8]) -> usize {
        (**self).pack(out)
    }
}

/// The full argument list of one log call.
///
/// Implemented for tuples of references, which is what `nano_log!` builds,
/// so each call site gets its own monomorphized packing routine.
pub trait LogArgs {
    const COUNT: usize;

    /// Argument tags in call order.
    const SIGNATURE: &'static [ArgType];

    fn packed_len(&self) -> usize;

    fn pack(&self, out: &mut [u8]) -> usize;
}

impl LogArgs for () {
    const COUNT: usize = 0;
    const SIGNATURE: &'static [ArgType] = &[];

    #[inline(always)]
    fn packed_len(&self) -> usize {
        0
    }

    #[inline(always)]
    fn pack(&self, _out: &mut [u8]) -> usize {
        0
    }
}

macro_rules! impl_log_args {
    ($count:expr; $($name:ident $idx:tt),+) => {
        impl<'a, $($name: Loggable + ?Sized),+> LogArgs for ($(&'a $name,)+) {
            const COUNT: usize = $count;
            const SIGNATURE: &'static [ArgType] = &[$($name::ARG_TYPE),+];

            #[inline(always)]
            fn packed_len(&self) -> usize {
                0 $(+ self.$idx.packed_len())+
            }

            #[inline(always)]
            fn pack(&self, out: &mut [u8]) -> usize {
                let mut pos = 0;
                $(pos += self.$idx.pack(&mut out[pos..]);)+
                pos
            }
        }
    };
}

impl_log_args!(1; A 0);
impl_log_args!(2; A 0, B 1);
impl_log_args!(3; A 0, B 1, C 2);
impl_log_args!(4; A 0, B 1, C 2, D 3);
impl_log_args!(5; A 0, B 1, C 2, D 3, E 4);
impl_log_args!(6; A 0, B 1, C 2, D 3, E 4, F 5);
impl_log_args!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_log_args!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);
impl_log_args!(9; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8);
impl_log_args!(10; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9);
impl_log_args!(11; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10);
impl_log_args!(12; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11);

/// A typed value decoded from a packed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    Pointer(u64),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::I8(v) => write!(f, "{}", v),
            ArgValue::I16(v) => write!(f, "{}", v),
            ArgValue::I32(v) => write!(f, "{}", v),
            ArgValue::I64(v) => write!(f, "{}", v),
            ArgValue::U8(v) => write!(f, "{}", v),
            ArgValue::U16(v) => write!(f, "{}", v),
            ArgValue::U32(v) => write!(f, "{}", v),
            ArgValue::U64(v) => write!(f, "{}", v),
            ArgValue::F32(v) => write!(f, "{}", v),
            ArgValue::F64(v) => write!(f, "{}", v),
            ArgValue::Bool(v) => write!(f, "{}", v),
            ArgValue::Char(v) => write!(f, "{}", v),
            ArgValue::Str(s) => f.write_str(s),
            ArgValue::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            ArgValue::Pointer(p) => write!(f, "{:#x}", p),
        }
    }
}

/// Why a packed payload could not be decoded against its signature.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptRecord {
    #[error("argument {index} ({arg_type}) needs {needed} bytes but only {available} remain")]
    ShortPayload {
        index: usize,
        arg_type: ArgType,
        needed: usize,
        available: usize,
    },
    #[error("{0} unread bytes after the last argument")]
    TrailingBytes(usize),
    #[error("argument {index} is not a valid char: {value:#x}")]
    InvalidChar { index: usize, value: u32 },
}

/// Little-endian cursor over a byte slice.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// The unread part of the input.
    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if len <= self.remaining() {
            let slice = &self.data[self.pos..self.pos + len];
            self.pos += len;
            Some(slice)
        } else {
            None
        }
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.read_bytes(N)?);
        Some(bytes)
    }

    pub(crate) fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|b| b[0])
    }

    pub(crate) fn read_u16(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub(crate) fn read_u32(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub(crate) fn read_u64(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads a `u32` length prefix followed by that many bytes.
    pub(crate) fn read_run(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }
}

/// Packs `args` into a freshly allocated buffer.
///
/// The logging path packs straight into the staging ring instead; this is
/// for tools and tests that assemble records by hand.
pub fn pack<A: LogArgs>(args: &A) -> Vec<u8> {
    let mut out = vec![0u8; args.packed_len()];
    let written = args.pack(&mut out);
    out.truncate(written);
    out
}

/// Decodes a payload produced by [`pack`] (or by a log call) using the
/// signature recorded for its call site.
///
/// ```
/// # use nanolog::packer::{pack, unpack, ArgType, ArgValue};
/// let bytes = pack(&(&7i32, &"seven"));
/// let values = unpack(&bytes, &[ArgType::I32, ArgType::Str]).unwrap();
/// assert_eq!(values, vec![ArgValue::I32(7), ArgValue::Str("seven".into())]);
/// ```
pub fn unpack(payload: &[u8], signature: &[ArgType]) -> Result<Vec<ArgValue>, CorruptRecord> {
    let mut reader = ByteReader::new(payload);
    let mut values = Vec::with_capacity(signature.len());

    for (index, &arg_type) in signature.iter().enumerate() {
        let short = |needed: usize, available: usize| CorruptRecord::ShortPayload {
            index,
            arg_type,
            needed,
            available,
        };
        let available = reader.remaining();

        let value = match arg_type.fixed_width() {
            Some(width) => {
                let raw = reader.read_bytes(width).ok_or(short(width, available))?;
                decode_fixed(arg_type, raw, index)?
            }
            None => {
                let len = reader.read_u32().ok_or(short(4, available))? as usize;
                let raw = reader
                    .read_bytes(len)
                    .ok_or(short(4 + len, available))?;
                match arg_type {
                    ArgType::Bytes => ArgValue::Bytes(raw.to_vec()),
                    _ => ArgValue::Str(String::from_utf8_lossy(raw).into_owned()),
                }
            }
        };
        values.push(value);
    }

    match reader.remaining() {
        0 => Ok(values),
        extra => Err(CorruptRecord::TrailingBytes(extra)),
    }
}

fn decode_fixed(arg_type: ArgType, raw: &[u8], index: usize) -> Result<ArgValue, CorruptRecord> {
    let mut wide = [0u8; 8];
    wide[..raw.len()].copy_from_slice(raw);
    let bits = u64::from_le_bytes(wide);

    Ok(match arg_type {
        ArgType::I8 => ArgValue::I8(bits as u8 as i8),
        ArgType::I16 => ArgValue::I16(bits as u16 as i16),
        ArgType::I32 => ArgValue::I32(bits as u32 as i32),
        ArgType::I64 => ArgValue::I64(bits as i64),
        ArgType::U8 => ArgValue::U8(bits as u8),
        ArgType::U16 => ArgValue::U16(bits as u16),
        ArgType::U32 => ArgValue::U32(bits as u32),
        ArgType::U64 => ArgValue::U64(bits),
        ArgType::F32 => ArgValue::F32(f32::from_bits(bits as u32)),
        ArgType::F64 => ArgValue::F64(f64::from_bits(bits)),
        ArgType::Bool => ArgValue::Bool(bits != 0),
        ArgType::Char => {
            let value = bits as u32;
            ArgValue::Char(char::from_u32(value).ok_or(CorruptRecord::InvalidChar { index, value })?)
        }
        ArgType::Pointer => ArgValue::Pointer(bits),
        ArgType::Str | ArgType::Bytes => unreachable!("length-prefixed types have no fixed width"),
    })
}
