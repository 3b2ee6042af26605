// SPDX-License-Identifier: MIT OR Apache-2.0

//! Binary encoding shared by session records and wire frames.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
