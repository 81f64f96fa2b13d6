//! Progressive estimate streams
//!
//! ## Table of Contents
//! - **EstimateStream**: Consumer side, a cancellable `futures::Stream`
//! - **EstimateSender**: Producer side, enforcing non-decreasing degrees
//! - **Drained**: Prefix of estimates plus the terminal error, if any

use crate::error::{PyramidError, Result};
use crate::types::Estimate;
use futures::future::join_all;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default number of pending estimates a stream buffers
pub const DEFAULT_BUFFER_SIZE: usize = 2;

/// Ordered, closable sequence of estimates for one (pyramid, cell) pair
///
/// Items are `Ok(estimate)` with non-decreasing degrees, optionally ended by a
/// single `Err`. Dropping the stream cancels its producer; [`cancel`] does the
/// same but also reports [`PyramidError::Cancelled`] to the consumer.
///
/// [`cancel`]: EstimateStream::cancel
pub struct EstimateStream<T> {
    inner: Option<BoxStream<'static, Result<Estimate<T>>>>,
    report_cancel: bool,
}

impl<T: Send + 'static> EstimateStream<T> {
    /// Create a bounded channel pair
    pub fn channel(buffer_size: usize) -> (EstimateSender<T>, Self) {
        let (tx, mut rx) = mpsc::channel(buffer_size.max(1));
        let stream = Self::from_stream(stream::poll_fn(move |cx| rx.poll_recv(cx)));
        let sender = EstimateSender {
            tx,
            last_degree: None,
        };
        (sender, stream)
    }

    /// Wrap any stream of estimate results
    pub fn from_stream<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Estimate<T>>> + Send + 'static,
    {
        Self {
            inner: Some(source.boxed()),
            report_cancel: false,
        }
    }

    /// A stream with one final estimate
    pub fn ready(estimate: Estimate<T>) -> Self {
        Self::from_stream(stream::iter([Ok(estimate)]))
    }

    /// A stream that fails immediately
    pub fn failed(error: PyramidError) -> Self {
        Self::from_stream(stream::iter([Err(error)]))
    }

    /// Stop the producer; the consumer sees one `Cancelled` error, then the end
    pub fn cancel(&mut self) {
        if self.inner.take().is_some() {
            debug!("Estimate stream cancelled by consumer");
            self.report_cancel = true;
        }
    }

    /// Whether the stream has ended or been cancelled
    pub fn is_terminated(&self) -> bool {
        self.inner.is_none() && !self.report_cancel
    }

    /// Transform every value, keeping degrees and errors
    pub fn map_values<U, F>(self, f: F) -> EstimateStream<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + 'static,
    {
        EstimateStream::from_stream(self.map(move |item| item.map(|estimate| estimate.map(&f))))
    }

    /// Drain the stream, returning the last estimate
    ///
    /// Fails with the stream's terminal error, or with `StreamClosed` if the
    /// stream ended without producing anything.
    pub async fn final_estimate(self) -> Result<Estimate<T>> {
        let drained = self.collect_estimates().await;
        if let Some(err) = drained.error {
            return Err(err);
        }
        drained
            .estimates
            .into_iter()
            .last()
            .ok_or_else(|| PyramidError::StreamClosed {
                cell: "estimate stream".to_string(),
            })
    }

    /// Drain the stream, keeping every estimate and the terminal error
    pub async fn collect_estimates(mut self) -> Drained<T> {
        let mut drained = Drained {
            estimates: Vec::new(),
            error: None,
        };
        while let Some(item) = self.next().await {
            match item {
                Ok(estimate) => drained.estimates.push(estimate),
                Err(err) => {
                    drained.error = Some(err);
                    break;
                }
            }
        }
        drained
    }
}

impl<T: Clone + Send + 'static> EstimateStream<T> {
    /// Split the stream into `copies` independent consumers
    ///
    /// A relay task forwards every item to each copy. It stops, dropping the
    /// source, once the source ends or every copy has been dropped. Must be
    /// called within a tokio runtime.
    pub fn fan_out(mut self, copies: usize, buffer_size: usize) -> Vec<EstimateStream<T>> {
        let mut senders = Vec::with_capacity(copies);
        let mut streams = Vec::with_capacity(copies);
        for _ in 0..copies {
            let (tx, stream) = Self::channel(buffer_size);
            senders.push(tx);
            streams.push(stream);
        }

        tokio::spawn(async move {
            loop {
                senders.retain(|tx| !tx.is_closed());
                if senders.is_empty() {
                    debug!("All fan-out copies dropped, releasing source");
                    return;
                }

                let item = tokio::select! {
                    item = self.next() => item,
                    _ = join_all(senders.iter().map(|tx| tx.closed())) => continue,
                };
                let Some(item) = item else {
                    return;
                };

                let terminal = item.is_err();
                for tx in &mut senders {
                    tx.forward(item.clone()).await;
                }
                if terminal {
                    return;
                }
            }
        });

        streams
    }
}

impl<T> Stream for EstimateStream<T> {
    type Item = Result<Estimate<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            if this.report_cancel {
                this.report_cancel = false;
                return Poll::Ready(Some(Err(PyramidError::Cancelled)));
            }
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// Everything a stream produced before it ended
#[derive(Debug, Clone)]
pub struct Drained<T> {
    /// Estimates in emission order
    pub estimates: Vec<Estimate<T>>,
    /// Error that closed the stream, if any
    pub error: Option<PyramidError>,
}

impl<T> Drained<T> {
    /// Degrees in emission order
    pub fn degrees(&self) -> Vec<f64> {
        self.estimates.iter().map(|e| e.degree).collect()
    }

    /// Last estimate produced
    pub fn last(&self) -> Option<&Estimate<T>> {
        self.estimates.last()
    }

    /// Whether the stream ended without error
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Producer half of an [`EstimateStream`]
///
/// Not `Clone`: every stream has exactly one producer.
pub struct EstimateSender<T> {
    tx: mpsc::Sender<Result<Estimate<T>>>,
    last_degree: Option<f64>,
}

impl<T> EstimateSender<T> {
    /// Emit an estimate; fails with `Cancelled` once the consumer is gone
    pub async fn emit(&mut self, estimate: Estimate<T>) -> Result<()> {
        debug_assert!(
            self.last_degree.map_or(true, |last| estimate.degree >= last),
            "estimate degrees must not decrease"
        );
        let degree = estimate.degree;
        self.tx
            .send(Ok(estimate))
            .await
            .map_err(|_| PyramidError::Cancelled)?;
        trace!(degree, "Estimate emitted");
        self.last_degree = Some(degree);
        Ok(())
    }

    /// Close the stream with an error
    pub async fn fail(self, error: PyramidError) -> Result<()> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| PyramidError::Cancelled)
    }

    /// Degree of the last emitted estimate
    pub fn last_degree(&self) -> Option<f64> {
        self.last_degree
    }

    /// Resolves once the consumer has dropped or cancelled the stream
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Whether the consumer has dropped or cancelled the stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn forward(&mut self, item: Result<Estimate<T>>) {
        if let Ok(estimate) = &item {
            self.last_degree = Some(estimate.degree);
        }
        let _ = self.tx.send(item).await;
    }
}
