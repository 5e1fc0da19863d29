//! Runtime support for generated WASM capabilities.
//!
//! This crate provides helpers for:
//! - Serving a capability: JSON arguments on stdin, text result on stdout
//! - Making HTTP requests (via host functions)
//! - Getting current time (via host functions)

use std::io::Read;

use serde::de::DeserializeOwned;
use serde_json::Value;

// ============ Host Function Imports ============
// These are implemented by the orchestrator's CapabilityRunner.
// Only available when compiling for WASM target.

#[cfg(target_arch = "wasm32")]
#[link(wasm_import_module = "host")]
extern "C" {
    /// Make an HTTP GET request.
    /// Returns: length of response written to `result_ptr`, or negative error code
    fn http_get(url_ptr: *const u8, url_len: i32, result_ptr: *mut u8, result_cap: i32) -> i32;

    /// Get current time in milliseconds since Unix epoch.
    fn current_time_millis() -> i64;

    /// Get current time in seconds since Unix epoch.
    fn current_time_secs() -> i64;
}

// ============ Native Stubs (for self-tests) ============

#[cfg(not(target_arch = "wasm32"))]
unsafe fn http_get(_url_ptr: *const u8, _url_len: i32, _result_ptr: *mut u8, _result_cap: i32) -> i32 {
    -7
}

#[cfg(not(target_arch = "wasm32"))]
fn current_time_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(not(target_arch = "wasm32"))]
fn current_time_secs() -> i64 {
    current_time_millis() / 1000
}

// ============ Entry Point ============

/// Read the JSON arguments from stdin, call `run` and print its result.
///
/// Errors go to stderr with exit code 1, which the host reports as a
/// capability failure.
pub fn serve<F>(run: F)
where
    F: FnOnce(&Value) -> Result<String, String>,
{
    let result = read_args().and_then(|args| run(&args));
    match result {
        Ok(output) => print!("{}", output),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

fn read_args() -> Result<Value, String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| format!("failed to read stdin: {}", e))?;
    if input.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(&input).map_err(|e| format!("invalid JSON arguments: {}", e))
}

// ============ Argument Helpers ============

/// Required string argument.
pub fn arg_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, String> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string argument '{}'", name))
}

/// Optional integer argument.
pub fn arg_i64(args: &Value, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

// ============ HTTP Functions (via host) ============

// Buffer size for HTTP responses (1MB)
const HTTP_BUFFER_SIZE: usize = 1024 * 1024;

/// Make an HTTP GET request and return the response body as a string.
///
/// Not available in native self-tests.
pub fn http_get_string(url: &str) -> Result<String, String> {
    let url_bytes = url.as_bytes();
    let mut buffer = vec![0u8; HTTP_BUFFER_SIZE];

    let result = unsafe {
        http_get(
            url_bytes.as_ptr(),
            url_bytes.len() as i32,
            buffer.as_mut_ptr(),
            buffer.len() as i32,
        )
    };

    if result < 0 {
        let error_msg = match result {
            -1 => "memory export not found",
            -2 => "URL pointer out of bounds",
            -3 => "invalid URL encoding",
            -4 => "HTTP request failed",
            -5 => "failed to read response body",
            -6 => "response buffer too small",
            -7 => "HTTP is only available inside the WASM runtime",
            _ => "unknown error",
        };
        return Err(format!("HTTP GET failed: {}", error_msg));
    }

    buffer.truncate(result as usize);
    String::from_utf8(buffer).map_err(|e| format!("response not valid UTF-8: {}", e))
}

/// Make an HTTP GET request and parse the response as JSON.
pub fn http_get_json<T: DeserializeOwned>(url: &str) -> Result<T, String> {
    let body = http_get_string(url)?;
    serde_json::from_str(&body).map_err(|e| format!("failed to parse JSON: {}", e))
}

// ============ Time Functions (via host) ============

/// Current UTC time as Unix timestamp in milliseconds.
pub fn utc_now_timestamp_millis() -> i64 {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { current_time_millis() }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        current_time_millis()
    }
}

/// Current UTC time as Unix timestamp in seconds.
pub fn utc_now_timestamp() -> i64 {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { current_time_secs() }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        current_time_secs()
    }
}

/// Current UTC time as an ISO 8601 string, e.g. "2024-01-15T10:30:00Z".
pub fn utc_now_iso8601() -> String {
    chrono::DateTime::from_timestamp(utc_now_timestamp(), 0)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

// Re-export commonly used items
pub use serde;
pub use serde_json;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arg_helpers() {
        let args = json!({"text": "hi", "count": 3});
        assert_eq!(arg_str(&args, "text").unwrap(), "hi");
        assert!(arg_str(&args, "missing").is_err());
        assert_eq!(arg_i64(&args, "count"), Some(3));
    }

    #[test]
    fn test_http_unavailable_natively() {
        let err = http_get_string("https://example.com").unwrap_err();
        assert!(err.contains("WASM runtime"));
    }

    #[test]
    fn test_iso_time_shape() {
        let now = utc_now_iso8601();
        assert_eq!(now.len(), 20);
        assert!(now.ends_with('Z'));
    }
}
