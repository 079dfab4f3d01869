use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle on a task spawned onto the runtime. Awaiting it yields the task's output; unlike
/// `tokio::task::JoinHandle`, a panicked or cancelled task is surfaced as a panic here rather
/// than a `JoinError`.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T> {
    inner: tokio::task::JoinHandle<T>,
}

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn new(inner: tokio::task::JoinHandle<T>) -> Self {
        Self { inner }
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|result| result.unwrap())
    }
}
