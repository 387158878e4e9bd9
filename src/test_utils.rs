//! Shared test utilities and macros.

use camino::Utf8Path;
use crossbeam::channel::{Receiver, Sender};
use std::time::Duration;

/// Asserts that a Result is Ok, printing the error if not.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        assert!($result.is_ok(), "Expected Ok, got Err: {:#?}", $result);
    };
}

/// Asserts that a Result is Err, printing the value if not.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        assert!($result.is_err(), "Expected Err, got Ok: {:#?}", $result);
    };
}

/// Holds a job body in place until the test opens it.
/// Clones share the same gate.
#[derive(Clone)]
pub struct Gate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        Gate { tx, rx }
    }

    /// Let one waiter through.
    pub fn open_one(&self) {
        self.tx.send(()).unwrap();
    }

    /// Block until opened. Panics after 10s so a broken test fails instead of hanging.
    pub fn wait(&self) {
        self.rx
            .recv_timeout(Duration::from_secs(10))
            .expect("gate was never opened");
    }
}

/// One-shot "I got here" signal from inside a job body.
pub fn signal() -> (Sender<()>, Receiver<()>) {
    crossbeam::channel::bounded(16)
}

pub fn wait_for_signal(rx: &Receiver<()>) {
    rx.recv_timeout(Duration::from_secs(10)).expect("signal never arrived");
}

pub fn tmp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

pub fn tmp_utf8(dir: &tempfile::TempDir) -> &Utf8Path {
    Utf8Path::from_path(dir.path()).unwrap()
}
