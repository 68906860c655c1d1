use serde::{de, Deserializer, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Unsigned integers that descriptor fields are stored as.
pub trait DescriptorInt: fmt::LowerHex + TryFrom<u64> + Copy {
    fn serialize_int<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error>;
}

impl DescriptorInt for u8 {
    fn serialize_int<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self)
    }
}

impl DescriptorInt for u16 {
    fn serialize_int<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(*self)
    }
}

pub(crate) fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: DescriptorInt,
{
    // Human readable formats get hex strings, which is how datasheets list these values.
    if serializer.is_human_readable() {
        serializer.serialize_str(&format!("{value:#x}"))
    } else {
        value.serialize_int(serializer)
    }
}

/// Accepts plain integers as well as `0x` prefixed hex strings.
pub(crate) fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DescriptorInt,
{
    struct Visitor<T>(PhantomData<T>);

    impl<T: DescriptorInt> de::Visitor<'_> for Visitor<T> {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an unsigned integer or a hex string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<T, E> {
            T::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<T, E> {
            let v = u64::try_from(v)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))?;
            self.visit_u64(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
            let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => v.parse(),
            };
            let parsed = parsed.map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))?;
            self.visit_u64(parsed)
        }
    }

    deserializer.deserialize_any(Visitor(PhantomData))
}
