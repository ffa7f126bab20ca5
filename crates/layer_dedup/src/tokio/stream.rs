use super::pipe::ChannelWriter;
use crate::filter::dedup_archive_with_cancellation;
use crate::{DedupError, DedupOptions, DedupStats, LayerAction, LayerSource};
use bytes::Bytes;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::{CancellationToken, DropGuard};

/// The rewritten archive of a pass that is still running.
///
/// Reading yields the output in order. The stream ends with a plain end of file if the pass
/// succeeded, or with an error if it failed; use [`crate::StreamError::from_io_error`] to find out
/// why. Dropping the stream cancels the pass.
#[derive(Debug)]
pub struct LayerStream {
    reader: StreamReader<ReceiverStream<std::io::Result<Bytes>>, Bytes>,
    task: JoinHandle<Result<DedupStats, DedupError>>,
    cancellation_token: CancellationToken,
    drop_guard: DropGuard,
}

impl LayerStream {
    /// Asks the producer to stop. The stream then ends with a [`DedupError::Cancelled`] error.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    /// Returns the token that cancels this pass.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Waits for the producer and returns the outcome of the pass.
    ///
    /// Call this after the stream has been read to the end. Output that was not read yet is
    /// discarded, which fails a pass that was still producing with
    /// [`DedupError::SinkWriteFailure`].
    ///
    /// # Panics
    ///
    /// Resumes the panic of the producer if it panicked.
    pub async fn finish(self) -> Result<DedupStats, DedupError> {
        let LayerStream {
            reader,
            task,
            drop_guard,
            ..
        } = self;
        drop(reader);
        drop_guard.disarm();

        match task.await.map_err(JoinError::try_into_panic) {
            Ok(result) => result,
            Err(Ok(payload)) => std::panic::resume_unwind(payload),
            Err(Err(_)) => Err(DedupError::Cancelled),
        }
    }
}

impl AsyncRead for LayerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// Starts a pass over the tar archive in `reader` and returns its output as it is produced.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub fn spawn_dedup<R>(reader: R, options: DedupOptions) -> LayerStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    spawn_dedup_read(SyncIoBridge::new(reader), options)
}

/// Like [`spawn_dedup`] for a blocking reader. The reader is only used on the blocking pool.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub fn spawn_dedup_read<R>(reader: R, options: DedupOptions) -> LayerStream
where
    R: Read + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(options.channel_capacity.max(1));
    let cancellation_token = CancellationToken::new();

    let producer_token = cancellation_token.clone();
    let task = tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(sender, options.chunk_size, producer_token.clone());
        match dedup_archive_with_cancellation(reader, &mut writer, &options, &producer_token) {
            Ok(stats) => match writer.finish() {
                Ok(()) => Ok(stats),
                Err(err) => Err(DedupError::SinkWriteFailure(err)),
            },
            Err(err) => {
                writer.fail(&err);
                Err(err)
            }
        }
    });

    LayerStream {
        reader: StreamReader::new(ReceiverStream::new(receiver)),
        task,
        drop_guard: cancellation_token.clone().drop_guard(),
        cancellation_token,
    }
}

/// Opens a fresh pass over a layer every time [`DedupOpener::open`] is called.
///
/// Every pass asks the [`LayerSource`] for a new reader and runs with its own index, so opening
/// the same layer twice produces the same bytes twice.
pub struct DedupOpener<S> {
    source: S,
    options: DedupOptions,
}

impl<S: LayerSource> DedupOpener<S> {
    /// Constructs an opener for the layer provided by `source`.
    pub fn new(source: S, options: DedupOptions) -> Self {
        Self { source, options }
    }

    /// The source of the layer.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The options every pass runs with.
    pub fn options(&self) -> &DedupOptions {
        &self.options
    }

    /// Returns whether the layer should be rewritten at all, based on its media type.
    pub fn action(&self) -> Result<LayerAction, DedupError> {
        Ok(LayerAction::for_media_type(&self.source.media_type()?))
    }

    /// Opens the layer and starts a new pass over it.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub async fn open(&self) -> Result<LayerStream, DedupError> {
        let reader = self.source.open().await?;
        tracing::debug!("starting a deduplication pass");
        Ok(spawn_dedup(reader, self.options.clone()))
    }
}
