//! Shared building blocks of the two wire formats.
//!
//! Binary: little-endian fixed-width integers, u16-length-prefixed UTF-8
//! strings, u32-length-prefixed byte arrays.
//!
//! JSON: one flat object per entity, byte arrays as base64 strings, 64-bit
//! tokens as decimal strings.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Protocol, ProtocolError};

/// Declares a protocol enum with an explicit integer representation.
///
/// The generated type is written as its integer in the binary format and as
/// its variant name in JSON. JSON loading accepts either the name or the
/// integer value.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(stringify!($variant) => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn value(self) -> $repr {
                self as $repr
            }
        }

        impl TryFrom<$repr> for $name {
            type Error = $crate::protocol::ProtocolError;

            fn try_from(value: $repr) -> Result<Self, Self::Error> {
                $(
                    if value == $name::$variant as $repr {
                        return Ok($name::$variant);
                    }
                )+
                Err($crate::protocol::ProtocolError::load(format!(
                    "invalid {} value {}",
                    stringify!($name),
                    value
                )))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl $crate::protocol::wire::WireField for $name {
            fn write(&self, w: &mut $crate::protocol::wire::BinaryWriter) -> Result<(), $crate::protocol::ProtocolError> {
                $crate::protocol::wire::WireField::write(&self.value(), w)
            }

            fn read(r: &mut $crate::protocol::wire::BinaryReader<'_>) -> Result<Self, $crate::protocol::ProtocolError> {
                let raw = <$repr as $crate::protocol::wire::WireField>::read(r)?;
                $name::try_from(raw)
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct EnumVisitor;

                impl<'de> ::serde::de::Visitor<'de> for EnumVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                        write!(f, "{} name or number", stringify!($name))
                    }

                    fn visit_str<E: ::serde::de::Error>(self, v: &str) -> Result<$name, E> {
                        $name::from_name(v).ok_or_else(|| {
                            E::custom(format!("unknown {} '{}'", stringify!($name), v))
                        })
                    }

                    fn visit_u64<E: ::serde::de::Error>(self, v: u64) -> Result<$name, E> {
                        $repr::try_from(v)
                            .ok()
                            .and_then(|raw| $name::try_from(raw).ok())
                            .ok_or_else(|| {
                                E::custom(format!("invalid {} value {}", stringify!($name), v))
                            })
                    }

                    fn visit_i64<E: ::serde::de::Error>(self, v: i64) -> Result<$name, E> {
                        match u64::try_from(v) {
                            Ok(v) => self.visit_u64(v),
                            Err(_) => Err(E::custom(format!(
                                "invalid {} value {}",
                                stringify!($name),
                                v
                            ))),
                        }
                    }
                }

                deserializer.deserialize_any(EnumVisitor)
            }
        }
    };
}

/// An entity that can be saved and loaded in both wire formats.
pub trait WireObject: Serialize + DeserializeOwned {
    fn save_binary(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError>;

    fn load_binary(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError>;

    fn save(&self, protocol: Protocol) -> Result<Vec<u8>, ProtocolError> {
        match protocol {
            Protocol::Binary => {
                let mut writer = BinaryWriter::new();
                self.save_binary(&mut writer)?;
                Ok(writer.into_inner())
            }
            Protocol::Json => Ok(serde_json::to_vec(self)?),
        }
    }

    fn load(body: &[u8], protocol: Protocol) -> Result<Self, ProtocolError> {
        match protocol {
            Protocol::Binary => {
                let mut reader = BinaryReader::new(body);
                let value = Self::load_binary(&mut reader)?;
                reader.finish()?;
                Ok(value)
            }
            Protocol::Json => serde_json::from_slice(body)
                .map_err(|e| ProtocolError::load(format!("invalid JSON body: {}", e))),
        }
    }
}

/// Growable little-endian output buffer.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Cursor over a complete message body.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::load(format!(
                "unexpected end of body: needed {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Fails if any bytes were left unread
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.remaining() != 0 {
            return Err(ProtocolError::load(format!(
                "{} trailing bytes after body",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// A single field of a wire object in the binary format.
pub trait WireField: Sized {
    fn write(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError>;

    fn read(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError>;
}

macro_rules! int_field {
    ($($ty:ty),+) => {
        $(
            impl WireField for $ty {
                fn write(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
                    w.put(&self.to_le_bytes());
                    Ok(())
                }

                fn read(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
                    Ok(<$ty>::from_le_bytes(r.take_array()?))
                }
            }
        )+
    };
}

int_field!(u8, u16, u32, u64);

impl WireField for bool {
    fn write(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
        u8::from(*self).write(w)
    }

    fn read(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
        match u8::read(r)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::load(format!("invalid boolean value {}", other))),
        }
    }
}

impl WireField for String {
    fn write(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
        let len = u16::try_from(self.len())
            .map_err(|_| ProtocolError::MessageTooLarge(self.len(), u16::MAX as usize))?;
        len.write(w)?;
        w.put(self.as_bytes());
        Ok(())
    }

    fn read(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
        let len = u16::read(r)? as usize;
        let bytes = r.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::load(format!("invalid UTF-8 string: {}", e)))
    }
}

impl WireField for Vec<u8> {
    fn write(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
        let len = u32::try_from(self.len())
            .map_err(|_| ProtocolError::MessageTooLarge(self.len(), u32::MAX as usize))?;
        len.write(w)?;
        w.put(self);
        Ok(())
    }

    fn read(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
        let len = u32::read(r)? as usize;
        Ok(r.take(len)?.to_vec())
    }
}

impl WireField for Vec<String> {
    fn write(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
        let count = u16::try_from(self.len())
            .map_err(|_| ProtocolError::MessageTooLarge(self.len(), u16::MAX as usize))?;
        count.write(w)?;
        for item in self {
            item.write(w)?;
        }
        Ok(())
    }

    fn read(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
        let count = u16::read(r)? as usize;
        // Each string costs at least its two length bytes
        if count * 2 > r.remaining() {
            return Err(ProtocolError::load(format!(
                "string list of {} items does not fit in {} bytes",
                count,
                r.remaining()
            )));
        }
        (0..count).map(|_| String::read(r)).collect()
    }
}

/// Serde adapter: byte arrays as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(|e| serde::de::Error::custom(format!("invalid base64: {}", e)))
    }
}

/// Serde adapter: 64-bit integers as decimal strings, so JSON consumers with
/// double-precision numbers cannot lose bits.
pub mod decimal_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid decimal '{}': {}", text, e)))
    }
}
