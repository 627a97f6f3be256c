//! Capability negotiation vocabulary.
//!
//! The connected service advertises raw capability tokens describing what
//! its version supports. The client translates those tokens into the public
//! feature vocabulary; one raw token may map to several public features.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Raw capability tokens reported by the sandboxed service.
pub mod service_tokens {
    /// Closing an isolate terminates the running evaluation and frees its
    /// resources immediately.
    pub const ISOLATE_TERMINATION: &str = "ISOLATE_TERMINATION";

    /// Marker for the service generation that added promise return,
    /// named-data transfer and WASM compilation together.
    pub const WASM_FROM_ARRAY_BUFFER: &str = "WASM_FROM_ARRAY_BUFFER";

    /// Isolates can be created with a bounded maximum heap size.
    pub const ISOLATE_MAX_HEAP_SIZE_LIMIT: &str = "ISOLATE_MAX_HEAP_SIZE_LIMIT";
}

/// A negotiable capability of the connected service version.
///
/// Check support with `JsSandbox::is_feature_supported` before depending on
/// any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    /// `JsIsolate::close` terminates the currently running evaluation and
    /// frees its resources immediately. Without it, the isolate keeps
    /// consuming resources until queued evaluations run to completion.
    IsolateTermination,

    /// JS expressions may return promises; the pending evaluation resolves
    /// to the awaited string once the promise settles.
    PromiseReturn,

    /// `JsIsolate::provide_named_data` and the matching consume API inside
    /// the JS environment are available.
    ProvideConsumeArrayBuffer,

    /// `WebAssembly.compile(ArrayBuffer)` is usable inside the sandbox.
    WasmCompilation,

    /// Isolates can be created with a bounded maximum heap size.
    IsolateMaxHeapSize,
}

/// Translate the raw token list reported by the service into the public
/// feature set. Unknown tokens are ignored so newer services stay
/// compatible with older clients.
pub fn translate_service_features<S: AsRef<str>>(raw: &[S]) -> HashSet<Feature> {
    let mut features = HashSet::new();
    for token in raw {
        match token.as_ref() {
            service_tokens::ISOLATE_TERMINATION => {
                features.insert(Feature::IsolateTermination);
            }
            service_tokens::WASM_FROM_ARRAY_BUFFER => {
                features.insert(Feature::PromiseReturn);
                features.insert(Feature::ProvideConsumeArrayBuffer);
                features.insert(Feature::WasmCompilation);
            }
            service_tokens::ISOLATE_MAX_HEAP_SIZE_LIMIT => {
                features.insert(Feature::IsolateMaxHeapSize);
            }
            _ => {}
        }
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_isolate_termination() {
        let raw = vec![service_tokens::ISOLATE_TERMINATION.to_string()];
        let features = translate_service_features(&raw);
        assert_eq!(features.len(), 1);
        assert!(features.contains(&Feature::IsolateTermination));
    }

    #[test]
    fn test_wasm_token_expands_to_three_features() {
        let raw = vec![service_tokens::WASM_FROM_ARRAY_BUFFER.to_string()];
        let features = translate_service_features(&raw);
        assert_eq!(features.len(), 3);
        assert!(features.contains(&Feature::PromiseReturn));
        assert!(features.contains(&Feature::ProvideConsumeArrayBuffer));
        assert!(features.contains(&Feature::WasmCompilation));
    }

    #[test]
    fn test_unknown_tokens_are_ignored() {
        let raw = vec![
            "SOME_FUTURE_CAPABILITY".to_string(),
            service_tokens::ISOLATE_MAX_HEAP_SIZE_LIMIT.to_string(),
        ];
        let features = translate_service_features(&raw);
        assert_eq!(features.len(), 1);
        assert!(features.contains(&Feature::IsolateMaxHeapSize));
    }

    #[test]
    fn test_empty_token_list() {
        let features = translate_service_features::<String>(&[]);
        assert!(features.is_empty());
    }
}
