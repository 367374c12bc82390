//! Port to the external transcription worker and its HTTP adapter.

pub mod client;
pub mod error;
pub mod types;

use std::future::Future;
use std::sync::Arc;

pub use client::HttpWorker;
pub use error::WorkerError;
pub use types::{DispatchAck, DispatchRequest, WorkerResult, WorkerStatus};

/// Something that can transcribe audio on request.
pub trait TranscriptionWorker: Send + Sync {
    /// Run the transcription and wait for the result.
    fn transcribe(
        &self,
        req: &DispatchRequest,
    ) -> impl Future<Output = Result<WorkerResult, WorkerError>> + Send;

    /// Hand the job over; the result arrives later at `req.callback_ref`.
    fn submit(
        &self,
        req: &DispatchRequest,
    ) -> impl Future<Output = Result<DispatchAck, WorkerError>> + Send;
}

impl<T: TranscriptionWorker> TranscriptionWorker for Arc<T> {
    async fn transcribe(&self, req: &DispatchRequest) -> Result<WorkerResult, WorkerError> {
        (**self).transcribe(req).await
    }

    async fn submit(&self, req: &DispatchRequest) -> Result<DispatchAck, WorkerError> {
        (**self).submit(req).await
    }
}
