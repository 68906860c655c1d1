mod hex_u_int;

pub(crate) use hex_u_int::{deserialize as hex_u_int_de, serialize as hex_u_int};
