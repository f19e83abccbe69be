#![cfg(unix)]

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use taskguard::fs::{FileSystem, LocalFs};
use taskguard::verify::{
    CommandResult, LdAdapter, Phase, TaskExecutionContext, run_with_verification,
};
use taskguard::{
    DependencySettings, Executor, ExecutorConfig, Severity, Task, TaskAction,
    TaskDependencySettings, TaskOutput, TaskStore, VerificationSetting,
};

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn link_task(id: &str, trace_file: &Utf8Path, json: &str, declared: &[&str]) -> Task {
    let script = format!("printf '%s' '{json}' > '{trace_file}'");
    Task::builder(id)
        .args(["/bin/sh", "-c", &script])
        .dependency_settings(TaskDependencySettings {
            trace_file: trace_file.to_path_buf(),
            dependency_settings: DependencySettings::new(
                Some(declared.iter().map(|d| d.to_string()).collect()),
                None,
            ),
        })
        .action(TaskAction::Linker)
        .build()
}

#[derive(Default)]
struct CountingFs(AtomicUsize);

impl CountingFs {
    fn tick(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl FileSystem for CountingFs {
    fn exists(&self, path: &Utf8Path) -> bool {
        self.tick();
        LocalFs.exists(path)
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        self.tick();
        LocalFs.remove(path)
    }

    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        self.tick();
        LocalFs.read(path)
    }

    fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn Read + Send>> {
        self.tick();
        LocalFs.open(path)
    }

    fn append(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
        self.tick();
        LocalFs.append(path, contents)
    }
}

#[tokio::test]
async fn linker_trace_is_verified_after_store_reload() {
    let (_dir, root) = scratch();

    let mut store = TaskStore::new();
    let ok = store
        .insert(link_task(
            "link ok",
            &root.join("ok.json"),
            r#"{"dynamic":["/usr/lib/libSystem.B.tbd","/F/Foo.framework/Foo"],"archives":["/x/libBar.a"]}"#,
            &["Foo", "Bar"],
        ))
        .unwrap();
    let bad = store
        .insert(link_task(
            "link bad",
            &root.join("bad.json"),
            r#"{"weak":["/F/Qux.framework/Qux"]}"#,
            &["Foo"],
        ))
        .unwrap();

    let mut buffer = Vec::new();
    store.serialize(&mut buffer).unwrap();
    let store = TaskStore::deserialize(buffer.as_slice()).unwrap();

    let diagnostics = Executor::new(ExecutorConfig::new())
        .run(&store, &[ok.clone(), bad.clone()])
        .await
        .unwrap();

    assert_eq!(diagnostics.execution_times[&ok].phase, Phase::Verified);
    assert_eq!(
        diagnostics.execution_times[&bad].phase,
        Phase::VerificationFailed
    );
    assert_eq!(diagnostics.execution_times[&bad].result, CommandResult::Failed);

    let errors: Vec<_> = diagnostics.messages[&bad]
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].message,
        "Undeclared dependencies: \n  Qux\n    - /F/Qux.framework/Qux"
    );
}

#[tokio::test]
async fn disabled_verification_never_touches_the_filesystem() {
    let (_dir, root) = scratch();
    let trace_file = root.join("trace.json");

    let task = Task::builder("link")
        .args(["/bin/sh", "-c", "exit 0"])
        .dependency_settings(TaskDependencySettings {
            trace_file: trace_file.clone(),
            dependency_settings: DependencySettings::new(
                Some(vec!["Foo".into()]),
                Some(VerificationSetting::Disabled),
            ),
        })
        .action(TaskAction::Linker)
        .build();

    let mut store = TaskStore::new();
    let id = store.insert(task).unwrap();

    let fs = Arc::new(CountingFs::default());
    let diagnostics = Executor::new(ExecutorConfig::new())
        .with_fs(fs.clone())
        .run(&store, &[id.clone()])
        .await
        .unwrap();

    assert_eq!(diagnostics.execution_times[&id].phase, Phase::Succeeded);
    assert_eq!(fs.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn linker_traces_merge_into_outer_file() {
    let (_dir, root) = scratch();
    let outer = root.join("outer.trace");

    let first = Task::builder("first")
        .args([
            "/bin/sh",
            "-c",
            &format!(
                r#"printf '%s' '{{"archives":["/x/libBar.a"]}}' > '{}'"#,
                root.join("first.json")
            ),
        ])
        .env("LD_TRACE_FILE", outer.as_str())
        .dependency_settings(TaskDependencySettings {
            trace_file: root.join("first.json"),
            dependency_settings: DependencySettings::new(Some(vec!["Bar".into()]), None),
        })
        .build();

    let second = Task::builder("second")
        .args([
            "/bin/sh",
            "-c",
            &format!(
                r#"printf '%s' '{{"archives":["/x/libBaz.a"]}}' > '{}'"#,
                root.join("second.json")
            ),
        ])
        .env("LD_TRACE_FILE", outer.as_str())
        .dependency_settings(TaskDependencySettings {
            trace_file: root.join("second.json"),
            dependency_settings: DependencySettings::new(Some(vec!["Baz".into()]), None),
        })
        .build();

    for task in [&first, &second] {
        let output = TaskOutput::new();
        let ctx = TaskExecutionContext::new(task, &LocalFs, &output);
        let execution = run_with_verification(&ctx, &LdAdapter).await.unwrap();

        // each sees only its own slice, so neither trips over the other's library
        assert_eq!(execution.phase, Phase::Verified);
        assert_eq!(output.count(Severity::Error), 0);
    }

    assert_eq!(
        std::fs::read_to_string(&outer).unwrap(),
        r#"{"archives":["/x/libBar.a"]}{"archives":["/x/libBaz.a"]}"#
    );
}
