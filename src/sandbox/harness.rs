//! JavaScript harness executed inside Node-based isolates.
//!
//! The harness reads the program from stdin, creates a `vm` context from a
//! null-prototype global with string code generation disabled, and builds
//! `writeFile`, `readFile`, `report`, `assert` and a captured `console`
//! inside that context. The only link back to the harness is a
//! closure-captured bridge that takes and returns primitives, so no object
//! of the harness realm (and no `Function` constructor that could reach
//! `require` or `process`) is reachable from the tests. Filesystem access
//! goes through the host over the line protocol in [`super::protocol`].

/// Harness source passed to `node -e`.
pub const NODE_HARNESS: &str = include_str!("harness.js");

/// Builds the `node` argument list for a harness run.
///
/// `permission_flag` is the flag enabling the Node permission model for the
/// running Node release, or `None` where another layer isolates the run.
pub fn node_args(memory_mb: u64, permission_flag: Option<&str>) -> Vec<String> {
    let mut args = vec![format!("--max-old-space-size={}", memory_mb)];
    if let Some(flag) = permission_flag {
        args.push(flag.to_string());
    }
    args.push("-e".to_string());
    args.push(NODE_HARNESS.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_args_apply_memory_ceiling() {
        let args = node_args(128, Some("--permission"));
        assert_eq!(args[0], "--max-old-space-size=128");
        assert_eq!(args[1], "--permission");
        assert_eq!(args[2], "-e");
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_node_args_without_permission_flag() {
        let args = node_args(64, None);
        assert_eq!(args.len(), 3);
        assert_eq!(args.last().map(String::as_str), Some(NODE_HARNESS));
    }

    #[test]
    fn test_context_is_built_from_a_null_prototype_global() {
        assert!(NODE_HARNESS.contains("vm.createContext(Object.create(null)"));
        assert!(NODE_HARNESS.contains("codeGeneration: { strings: false, wasm: false }"));
    }

    #[test]
    fn test_bootstrap_never_receives_harness_objects() {
        let start = NODE_HARNESS.find("const BOOTSTRAP").expect("bootstrap");
        let end = NODE_HARNESS[start..].find("})`;").expect("bootstrap end") + start;
        let bootstrap = &NODE_HARNESS[start..end];

        // Globals are defined in the context, not passed in.
        for name in ["writeFile", "readFile", "report", "assert", "console"] {
            assert!(
                bootstrap.contains(&format!("install('{}'", name)),
                "{} is not built inside the context",
                name
            );
        }
        assert!(!bootstrap.contains("require("));
        assert!(!bootstrap.contains("process."));
        assert!(NODE_HARNESS.contains("(bridge);"));
    }
}
