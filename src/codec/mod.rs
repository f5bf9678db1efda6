//! Wire formats: the zip bundle container and the flat preference document.

pub mod archive;
pub mod markup;

pub use archive::{decode, encode, FORMAT_VERSION};
pub use markup::{decode_preferences, encode_preferences, Preference, PreferenceValue};
