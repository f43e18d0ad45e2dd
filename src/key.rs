//! Cache key derivation.

use std::sync::Arc;

use serde::Serialize;

/// Maps parameters to the key of the cache entry they load into.
pub type IdentifierFn<P> = Arc<dyn Fn(&P) -> String + Send + Sync>;

/// Structural key of `params`: its compact JSON serialization.
///
/// Two parameter values map to the same key exactly when they serialize
/// identically, so field order follows the type's declaration order.
pub fn structural_key<P: Serialize + ?Sized>(params: &P) -> String {
    match serde_json::to_string(params) {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(%err, "parameters are not serializable; using an empty key");
            String::new()
        }
    }
}

pub(crate) fn structural<P: Serialize + 'static>() -> IdentifierFn<P> {
    Arc::new(|params: &P| structural_key(params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Page {
        page: u32,
        page_size: u32,
    }

    #[test]
    fn test_structural_key_of_struct() {
        let key = structural_key(&Page {
            page: 2,
            page_size: 10,
        });
        assert_eq!(key, r#"{"page":2,"page_size":10}"#);
    }

    #[test]
    fn test_structural_key_of_scalars() {
        assert_eq!(structural_key(&5u32), "5");
        assert_eq!(structural_key("abc"), "\"abc\"");
        assert_eq!(structural_key(&vec!["1", "2"]), r#"["1","2"]"#);
    }

    #[test]
    fn test_unserializable_map_key() {
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "tuple keys are not valid json object keys");
        assert_eq!(structural_key(&map), "");
    }

    #[test]
    fn test_identifier_fn() {
        let identify = structural::<(u32, bool)>();
        assert_eq!(identify(&(1, true)), "[1,true]");
    }
}
