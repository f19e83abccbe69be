use camino::Utf8Path;
use serde::de::DeserializeOwned;

use crate::error::TraceError;
use crate::fs::FileSystem;

/// Deletes a trace left over from an earlier invocation, so that a tool
/// which fails to write one is not verified against stale data.
pub(crate) fn remove_stale(fs: &dyn FileSystem, trace_file: &Utf8Path) -> Result<(), TraceError> {
    if fs.exists(trace_file) {
        tracing::trace!(path = %trace_file, "removing stale trace");
        fs.remove(trace_file).map_err(|source| TraceError::Remove {
            path: trace_file.to_path_buf(),
            source,
        })?;
    }

    Ok(())
}

/// Decodes the trace written by one invocation.
///
/// With an `outer` file, the raw trace bytes are first appended to it
/// verbatim, then only this invocation's own bytes are decoded. Without one
/// the trace is decoded straight from the file.
pub fn read_and_maybe_merge<T: DeserializeOwned>(
    fs: &dyn FileSystem,
    trace_file: &Utf8Path,
    outer: Option<&Utf8Path>,
) -> Result<T, TraceError> {
    let read_error = |source| TraceError::Read {
        path: trace_file.to_path_buf(),
        source,
    };
    let decode_error = |source| TraceError::Decode {
        path: trace_file.to_path_buf(),
        source,
    };

    match outer {
        Some(outer) => {
            let bytes = fs.read(trace_file).map_err(read_error)?;

            fs.append(outer, &bytes)
                .map_err(|source| TraceError::Append {
                    path: outer.to_path_buf(),
                    source,
                })?;
            tracing::debug!(trace = %trace_file, %outer, len = bytes.len(), "merged trace");

            serde_json::from_slice(&bytes).map_err(decode_error)
        }
        None => {
            let reader = fs.open(trace_file).map_err(read_error)?;
            serde_json::from_reader(reader).map_err(decode_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::fs::LocalFs;
    use crate::verify::tests::scratch;

    type Trace = BTreeMap<String, Vec<String>>;

    #[test]
    fn test_direct_decode() {
        let (_dir, root) = scratch();
        let trace_file = root.join("t.json");
        std::fs::write(&trace_file, r#"{"dynamic":["/a"]}"#).unwrap();

        let trace: Trace = read_and_maybe_merge(&LocalFs, &trace_file, None).unwrap();
        assert_eq!(trace["dynamic"], ["/a"]);
    }

    #[test]
    fn test_merge_appends_verbatim() {
        let (_dir, root) = scratch();
        let outer = root.join("outer.trace");
        std::fs::write(&outer, "existing\n").unwrap();

        let first = root.join("first.json");
        let second = root.join("second.json");
        std::fs::write(&first, r#"{"dynamic":["/a"]}"#).unwrap();
        std::fs::write(&second, r#"{"dynamic":["/b"]}"#).unwrap();

        let a: Trace = read_and_maybe_merge(&LocalFs, &first, Some(&outer)).unwrap();
        let b: Trace = read_and_maybe_merge(&LocalFs, &second, Some(&outer)).unwrap();

        // each decode sees only its own invocation
        assert_eq!(a["dynamic"], ["/a"]);
        assert_eq!(b["dynamic"], ["/b"]);
        assert_eq!(
            std::fs::read_to_string(&outer).unwrap(),
            r#"existing
{"dynamic":["/a"]}{"dynamic":["/b"]}"#
        );
    }

    #[test]
    fn test_missing_trace() {
        let (_dir, root) = scratch();
        let err = read_and_maybe_merge::<Trace>(&LocalFs, &root.join("none.json"), None)
            .unwrap_err();
        assert!(matches!(err, TraceError::Read { .. }));
    }

    #[test]
    fn test_remove_stale() {
        let (_dir, root) = scratch();
        let trace_file = root.join("t.json");
        std::fs::write(&trace_file, "{}").unwrap();

        remove_stale(&LocalFs, &trace_file).unwrap();
        assert!(!trace_file.exists());
        remove_stale(&LocalFs, &trace_file).unwrap();
    }
}
