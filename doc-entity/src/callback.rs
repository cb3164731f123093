use futures::{FutureExt, future::Map};

use crate::Error;

/// Completion-callback form of the async API: any operation future can be
/// turned into one that hands its result to `callback` instead of
/// returning it.
pub trait WithCallback<T>: Future<Output = Result<T, Error>> + Sized {
    fn with_callback<F, R>(self, callback: F) -> Map<Self, F>
    where
        F: FnOnce(Result<T, Error>) -> R,
    {
        self.map(callback)
    }
}

impl<T, Fut> WithCallback<T> for Fut where Fut: Future<Output = Result<T, Error>> {}
