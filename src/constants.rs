//! # Constants.

use std::time::Duration;

/// Prefix prepended to the name of every neutralized attribute, element and
/// CSS function.
pub const NEUTRALIZED_PREFIX: &str = "proton-";

/// Attribute left on an element whose inline base64 payload was moved to a
/// [`Base64Cache`](crate::base64_cache::Base64Cache).
pub const BASE64_MARKER_ATTR: &str = "data-proton-replace-base";

/// Attribute remembering the `cid:` an embedded image was rendered from.
pub const EMBEDDED_CID_ATTR: &str = "data-embedded-img";

/// Class added to images pointing at decrypted embedded content.
pub const EMBEDDED_CLASS: &str = "proton-embedded";

/// Inline data URIs at most this long stay in the markup.
pub const DEFAULT_BASE64_THRESHOLD: usize = 256;

/// Grace period before the signature of a freshly decrypted attachment
/// is verified again.
pub const DEFAULT_SIGNATURE_RECHECK_DELAY: Duration = Duration::from_millis(1000);

/// `Accept` header value of the mail API.
pub const API_CONTENT_TYPE: &str = "application/vnd.protonmail.v1+json";

/// "Show images" flag: remote content may be loaded.
pub const SHOW_IMAGES_REMOTE: i32 = 1;

/// "Show images" flag: embedded content may be decrypted and shown.
pub const SHOW_IMAGES_EMBEDDED: i32 = 2;

/// Progress reported for a request that just started.
pub(crate) const UPLOAD_PROGRESS_START: u8 = 1;

/// Highest progress reported while bytes are still in flight.
pub(crate) const UPLOAD_PROGRESS_TRANSFER_MAX: u8 = 99;

/// Progress reported once the server answered.
pub(crate) const UPLOAD_PROGRESS_DONE: u8 = 100;
