//! # synclane value
//!
//! Dynamic values shared by documents, index keys and function arguments.
//!
//! - [`Value`] has a total order across types, so index keys built from
//!   heterogeneous fields always compare.
//! - [`to_json`] / [`from_json`] convert to and from a JSON-compatible form
//!   used on the wire.
//! - [`to_cbor`] / [`from_cbor`] encode records for local persistence.
//!
//! ## Usage
//!
//! ```
//! use synclane_value::{from_json_str, to_json_string, Value};
//!
//! let value = Value::object([("id", Value::from("a")), ("n", Value::Integer(1))]);
//! let text = to_json_string(&value).unwrap();
//! assert_eq!(from_json_str(&text).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod json;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use json::{from_json, from_json_str, to_json, to_json_string};
pub use value::Value;
