//! FFI interface for host applications
//!
//! The page is passed as a byte buffer, everything else as JSON. Results are
//! JSON strings owned by Rust and must be released with `free_parse_result`.
//! Hosts that keep rules up to date hold a [`RulesManager`] handle created by
//! `snippet_parser_rules_manager_new` and pass it to the `_with_manager`
//! entry point.

use std::collections::BTreeMap;
use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::str::Utf8Error;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::assign::{Container, Slot};
use crate::config::{PipelineConfig, RulesManagerConfig};
use crate::pipeline::{NoopObserver, Pipeline};
use crate::row::Row;
use crate::rules::{CompiledRules, RuleSetPatch};
use crate::rules_manager::{FileStorage, HttpRuleSource, RulesManager};

/// Result struct returned to the host
/// Both pointers are owned by Rust and must be freed via free_parse_result
#[repr(C)]
pub struct ParseResultFFI {
    /// JSON-serialized response (null-terminated), or null on failure
    pub json_ptr: *mut c_char,
    /// JSON `{"message", "code"}` on failure, or null on success
    pub error_ptr: *mut c_char,
}

/// Optional settings of one call. Rules are merged over the embedded set.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ParseRequest {
    pub rules: Option<RuleSetPatch>,
    pub config: Option<PipelineConfig>,
    pub containers: Vec<Container>,
}

#[derive(Debug, Serialize)]
struct ParseResponse<'a> {
    rows: &'a [Row],
    assignment: &'a BTreeMap<String, Slot>,
    unassigned: &'a [String],
    assigned: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    message: &'a str,
    code: &'a str,
}

/// Parse a captured results page and assign its rows.
///
/// # Arguments
/// * `input_ptr` - Pointer to the HTML or MHTML text (UTF-8, not necessarily null-terminated)
/// * `input_len` - Length of the input in bytes
/// * `request_json` - JSON-serialized ParseRequest (null-terminated), or null for defaults
///
/// # Safety
/// - `input_ptr` must point to valid memory of at least `input_len` bytes
/// - `request_json` must be null or a valid null-terminated C string
/// - Caller must free the result via `free_parse_result`
#[no_mangle]
pub unsafe extern "C" fn parse_search_results(
    input_ptr: *const c_char,
    input_len: usize,
    request_json: *const c_char,
) -> ParseResultFFI {
    match read_call(input_ptr, input_len, request_json) {
        Ok((input, request)) => run_request(input, &request, &CompiledRules::default()),
        Err(error) => error,
    }
}

/// Parse a page with the manager's current rules. A request's `rules` patch
/// is merged over them for this call only.
///
/// # Safety
/// - `handle` must be null or a live pointer from `snippet_parser_rules_manager_new`
/// - The remaining arguments follow `parse_search_results`
#[no_mangle]
pub unsafe extern "C" fn parse_search_results_with_manager(
    handle: *const RulesManager,
    input_ptr: *const c_char,
    input_len: usize,
    request_json: *const c_char,
) -> ParseResultFFI {
    let Some(manager) = handle.as_ref() else {
        return make_error_result("Rules manager handle is null", "INVALID_HANDLE");
    };
    match read_call(input_ptr, input_len, request_json) {
        Ok((input, request)) => run_request(input, &request, &manager.current().rules),
        Err(error) => error,
    }
}

unsafe fn read_call<'a>(
    input_ptr: *const c_char,
    input_len: usize,
    request_json: *const c_char,
) -> Result<(&'a str, ParseRequest), ParseResultFFI> {
    let input = if input_ptr.is_null() || input_len == 0 {
        ""
    } else {
        let slice = std::slice::from_raw_parts(input_ptr as *const u8, input_len);
        std::str::from_utf8(slice)
            .map_err(|_| make_error_result("Invalid UTF-8 in input", "INVALID_INPUT"))?
    };

    let text = c_str(request_json)
        .map_err(|_| make_error_result("Invalid UTF-8 in request JSON", "INVALID_REQUEST"))?;
    let request = match text {
        Some(text) => parse_request(text).map_err(|e| {
            make_error_result(&format!("Failed to parse request JSON: {}", e), "INVALID_REQUEST")
        })?,
        None => ParseRequest::default(),
    };
    Ok((input, request))
}

/// `None` for a null pointer
unsafe fn c_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, Utf8Error> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr).to_str().map(Some)
}

fn parse_request(text: &str) -> Result<ParseRequest, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(ParseRequest::default());
    }
    serde_json::from_str(text)
}

fn run_request(input: &str, request: &ParseRequest, base: &CompiledRules) -> ParseResultFFI {
    let patched;
    let rules = match &request.rules {
        Some(patch) => {
            patched = CompiledRules::new(base.rule_set().merge(patch));
            &patched
        }
        None => base,
    };
    let pipeline = Pipeline::new(request.config.clone().unwrap_or_default());

    let output = match pipeline.run(input, rules, &request.containers, &mut NoopObserver) {
        Ok(output) => output,
        Err(e) => return make_error_result(&e.to_string(), e.code()),
    };

    json_result(&ParseResponse {
        rows: &output.rows,
        assignment: &output.assignment.slots,
        unassigned: &output.assignment.unassigned,
        assigned: output.assignment.assigned,
    })
}

fn json_result<T: Serialize>(value: &T) -> ParseResultFFI {
    match serde_json::to_string(value) {
        Ok(json) => match CString::new(json) {
            Ok(cstr) => ParseResultFFI {
                json_ptr: cstr.into_raw(),
                error_ptr: ptr::null_mut(),
            },
            Err(_) => make_error_result("Result JSON contains null bytes", "SERIALIZE"),
        },
        Err(e) => make_error_result(&format!("Failed to serialize result: {}", e), "SERIALIZE"),
    }
}

/// Free a ParseResultFFI returned by parse_search_results
///
/// # Safety
/// - `result` must have been returned by `parse_search_results`
/// - Must only be called once per result
#[no_mangle]
pub unsafe extern "C" fn free_parse_result(result: ParseResultFFI) {
    if !result.json_ptr.is_null() {
        drop(CString::from_raw(result.json_ptr));
    }
    if !result.error_ptr.is_null() {
        drop(CString::from_raw(result.error_ptr));
    }
}

/// Create a rules manager. Rules persist as files under `storage_dir`, or in
/// memory when it is null. Returns null when the config JSON is invalid or
/// the directory cannot be created.
///
/// # Safety
/// - `config_json` and `storage_dir` must be null or valid null-terminated C strings
/// - A non-null result must be released with `snippet_parser_rules_manager_free`
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_rules_manager_new(
    config_json: *const c_char,
    storage_dir: *const c_char,
) -> *mut RulesManager {
    let config = match c_str(config_json) {
        Ok(Some(text)) if !text.trim().is_empty() => match RulesManagerConfig::from_json(text) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "invalid rules manager config");
                return ptr::null_mut();
            }
        },
        Ok(_) => RulesManagerConfig::default(),
        Err(_) => return ptr::null_mut(),
    };

    let manager = match c_str(storage_dir) {
        Ok(Some(dir)) => match FileStorage::new(dir) {
            Ok(storage) => RulesManager::load(Arc::new(storage), Arc::new(HttpRuleSource::new(&config))),
            Err(e) => {
                warn!(error = %e, "rules storage unavailable");
                return ptr::null_mut();
            }
        },
        Ok(None) => RulesManager::with_defaults(&config),
        Err(_) => return ptr::null_mut(),
    };
    Box::into_raw(Box::new(manager))
}

/// # Safety
/// `handle` must be null or come from `snippet_parser_rules_manager_new`, and
/// is invalid after this call
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_rules_manager_free(handle: *mut RulesManager) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Fetch remote rules and report `{"hasUpdate", "newVersion", "hash"}`.
/// A null `url` uses the stored remote URL.
///
/// # Safety
/// `handle` must be null or live; `url` must be null or a valid C string
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_check_for_updates(
    handle: *const RulesManager,
    url: *const c_char,
) -> ParseResultFFI {
    let Some(manager) = handle.as_ref() else {
        return make_error_result("Rules manager handle is null", "INVALID_HANDLE");
    };
    match c_str(url) {
        Ok(url) => json_result(&manager.check_for_updates(url)),
        Err(_) => make_error_result("Invalid UTF-8 in URL", "INVALID_REQUEST"),
    }
}

/// Promote the pending rules when their hash is `hash`
///
/// # Safety
/// `handle` must be null or live; `hash` must be null or a valid C string
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_apply_remote_rules(
    handle: *const RulesManager,
    hash: *const c_char,
) -> bool {
    match (handle.as_ref(), c_str(hash)) {
        (Some(manager), Ok(Some(hash))) => manager.apply_remote_rules(hash),
        _ => false,
    }
}

/// # Safety
/// `handle` must be null or live
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_dismiss_update(handle: *const RulesManager) -> bool {
    match handle.as_ref() {
        Some(manager) => manager.dismiss_update().is_ok(),
        None => false,
    }
}

/// Store the remote URL used when a check passes no URL; empty clears it
///
/// # Safety
/// `handle` must be null or live; `url` must be null or a valid C string
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_set_remote_url(
    handle: *const RulesManager,
    url: *const c_char,
) -> bool {
    match (handle.as_ref(), c_str(url)) {
        (Some(manager), Ok(url)) => manager.set_remote_url(url.unwrap_or("")).is_ok(),
        _ => false,
    }
}

/// Metadata of the active rules as JSON
///
/// # Safety
/// `handle` must be null or live
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_rules_metadata(handle: *const RulesManager) -> ParseResultFFI {
    match handle.as_ref() {
        Some(manager) => json_result(&manager.metadata()),
        None => make_error_result("Rules manager handle is null", "INVALID_HANDLE"),
    }
}

/// Return to the embedded rules and report the new metadata
///
/// # Safety
/// `handle` must be null or live
#[no_mangle]
pub unsafe extern "C" fn snippet_parser_reset_rules(handle: *const RulesManager) -> ParseResultFFI {
    let Some(manager) = handle.as_ref() else {
        return make_error_result("Rules manager handle is null", "INVALID_HANDLE");
    };
    match manager.reset_to_defaults() {
        Ok(metadata) => json_result(&metadata),
        Err(e) => make_error_result(&e.to_string(), "STORAGE"),
    }
}

/// Install a stderr log subscriber filtered by `RUST_LOG` (default `info`).
/// Returns false when a subscriber is already installed.
#[no_mangle]
pub extern "C" fn snippet_parser_init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

fn make_error_result(message: &str, code: &str) -> ParseResultFFI {
    let json = serde_json::to_string(&ErrorResponse { message, code })
        .unwrap_or_else(|_| format!("{{\"message\":\"error\",\"code\":\"{}\"}}", code));
    let error_cstr = CString::new(json).unwrap_or_default();
    ParseResultFFI {
        json_ptr: ptr::null_mut(),
        error_ptr: error_cstr.into_raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    unsafe fn take_json(ptr: *mut c_char) -> Value {
        assert!(!ptr.is_null());
        let text = CStr::from_ptr(ptr).to_str().unwrap().to_string();
        serde_json::from_str(&text).unwrap()
    }

    fn call(input: &str, request: Option<&str>) -> (Option<Value>, Option<Value>) {
        let request = request.map(|r| CString::new(r).unwrap());
        let request_ptr = request.as_ref().map(|r| r.as_ptr()).unwrap_or(ptr::null());
        unsafe {
            let result = parse_search_results(input.as_ptr() as *const c_char, input.len(), request_ptr);
            let json = (!result.json_ptr.is_null()).then(|| take_json(result.json_ptr));
            let error = (!result.error_ptr.is_null()).then(|| take_json(result.error_ptr));
            free_parse_result(result);
            (json, error)
        }
    }

    const PAGE: &str = r#"<html><body>
        <div class="EShopItem"><a href="https://a.test/1"><span class="OrganicTitle">Iron</span></a>
            <span class="EShopName">Shop A</span><span class="EPrice-Value">3 190 ₽</span></div>
    </body></html>"#;

    #[test]
    fn test_parse_with_containers() {
        let request = r#"{"containers": [{"id": "1:2", "name": "EShopItem"}, {"id": "1:3", "name": "ESnippet"}]}"#;
        let (json, error) = call(PAGE, Some(request));
        assert!(error.is_none());
        let json = json.unwrap();
        assert_eq!(json["rows"][0]["#OrganicTitle"], "Iron");
        assert_eq!(json["assignment"]["1:2"]["kind"], "matched");
        assert_eq!(json["assignment"]["1:2"]["row_index"], 0);
        assert_eq!(json["unassigned"][0], "1:3");
        assert_eq!(json["assigned"], 1);
    }

    #[test]
    fn test_rules_override() {
        let request = r##"{"rules": {"rules": {"#OrganicTitle": {"domSelectors": [".EShopName"]}}}}"##;
        let (json, _) = call(PAGE, Some(request));
        assert_eq!(json.unwrap()["rows"][0]["#OrganicTitle"], "Shop A");
    }

    #[test]
    fn test_errors() {
        let (json, error) = call("plain text", None);
        assert!(json.is_none());
        assert_eq!(error.unwrap()["code"], "NO_HTML_FOUND");

        let (_, error) = call(PAGE, Some("{not json"));
        assert_eq!(error.unwrap()["code"], "INVALID_REQUEST");
    }

    #[test]
    fn test_manager_handle() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = CString::new(dir.path().to_str().unwrap()).unwrap();
        unsafe {
            let handle = snippet_parser_rules_manager_new(ptr::null(), dir_path.as_ptr());
            assert!(!handle.is_null());

            let result = snippet_parser_rules_metadata(handle);
            assert_eq!(take_json(result.json_ptr)["source"], "embedded");
            free_parse_result(result);

            let result = parse_search_results_with_manager(
                handle,
                PAGE.as_ptr() as *const c_char,
                PAGE.len(),
                ptr::null(),
            );
            assert_eq!(take_json(result.json_ptr)["rows"][0]["#OrganicTitle"], "Iron");
            free_parse_result(result);

            let url = CString::new("https://rules.test/rules.json").unwrap();
            assert!(snippet_parser_set_remote_url(handle, url.as_ptr()));
            assert_eq!((*handle).remote_url().as_deref(), Some("https://rules.test/rules.json"));

            let hash = CString::new("unknown").unwrap();
            assert!(!snippet_parser_apply_remote_rules(handle, hash.as_ptr()));
            assert!(snippet_parser_dismiss_update(handle));

            let result = snippet_parser_reset_rules(handle);
            assert_eq!(take_json(result.json_ptr)["source"], "embedded");
            free_parse_result(result);

            snippet_parser_rules_manager_free(handle);
        }
    }

    #[test]
    fn test_manager_request_patch() {
        let request = CString::new(r##"{"rules": {"rules": {"#OrganicTitle": {"domSelectors": [".EShopName"]}}}}"##).unwrap();
        unsafe {
            let handle = snippet_parser_rules_manager_new(ptr::null(), ptr::null());
            let result = parse_search_results_with_manager(
                handle,
                PAGE.as_ptr() as *const c_char,
                PAGE.len(),
                request.as_ptr(),
            );
            assert_eq!(take_json(result.json_ptr)["rows"][0]["#OrganicTitle"], "Shop A");
            free_parse_result(result);
            snippet_parser_rules_manager_free(handle);
        }
    }

    #[test]
    fn test_null_and_invalid_handles() {
        unsafe {
            let result = snippet_parser_rules_metadata(ptr::null());
            assert_eq!(take_json(result.error_ptr)["code"], "INVALID_HANDLE");
            free_parse_result(result);

            let result = snippet_parser_check_for_updates(ptr::null(), ptr::null());
            assert_eq!(take_json(result.error_ptr)["code"], "INVALID_HANDLE");
            free_parse_result(result);

            assert!(!snippet_parser_dismiss_update(ptr::null()));
            snippet_parser_rules_manager_free(ptr::null_mut());

            let config = CString::new("{not json").unwrap();
            assert!(snippet_parser_rules_manager_new(config.as_ptr(), ptr::null()).is_null());
        }
    }
}
