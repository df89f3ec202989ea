use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use pin_project_lite::pin_project;

pin_project! {
    /// Future returned by [`timed`]. Resolves to the inner output together
    /// with the wall time spent from the first poll until completion.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct Timed<F>
    where
        F: Future,
    {
        #[pin]
        inner: F,
        start: Option<Instant>,
    }
}

impl<F> Future for Timed<F>
where
    F: Future,
{
    type Output = (F::Output, Duration);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let start = *this.start.get_or_insert_with(Instant::now);
        match this.inner.poll(cx) {
            Poll::Ready(output) => Poll::Ready((output, start.elapsed())),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub fn timed<F: Future>(inner: F) -> Timed<F> {
    Timed { inner, start: None }
}
