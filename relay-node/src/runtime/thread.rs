use std::fmt;
use std::thread;

pub use thread::*;

/// Spawn an OS thread, named after the node and the task it runs.
pub fn spawn<N, D, F, T>(node: &N, label: D, f: F) -> thread::JoinHandle<T>
where
    N: fmt::Display + ?Sized,
    D: fmt::Display,
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name(node, label))
        .spawn(f)
        .expect("thread::spawn: thread label must not contain NULL bytes")
}

pub fn name<N: fmt::Display + ?Sized, D: fmt::Display>(node: &N, label: D) -> String {
    if cfg!(debug_assertions) {
        format!("{node} {:<12}", format!("<{label}>"))
    } else {
        format!("{label}")
    }
}
