//! The orchestrator: transport in, decoder dispatch out.
//!
//! A [Pipeline] owns one connection. A spawned task reads chunks, routes them through the framing
//! adapter or a demuxer, buffers video against jitter, sheds load when behind, and dispatches units
//! to the [Sinks] supplied by the caller. Progress is reported through [Event]s.
mod config;
mod event;
pub(crate) mod g711;
mod session;
mod sink;
mod stats;

pub use config::*;
pub use event::*;
pub use sink::*;
pub use stats::*;

use std::sync::{Arc, atomic::Ordering};

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tokio::{
	sync::{mpsc, oneshot},
	task::JoinHandle,
};

use crate::{Error, Result, transport};
use session::{Session, Shared};

/// The lifecycle of a [Pipeline].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
	#[default]
	Idle,
	Connecting,
	Streaming,
	Stopped,
	Faulted,
}

/// A running (or runnable) ingest pipeline.
pub struct Pipeline {
	config: PipelineConfig,

	// Taken when the task starts.
	sinks: Option<Sinks>,

	state: Arc<Mutex<PipelineState>>,
	stats: StatsTracker,
	shared: Arc<Shared>,
	events: mpsc::UnboundedSender<Event>,

	// Dropping this tells the task to exit.
	closed: Option<oneshot::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

impl Pipeline {
	/// Create an idle pipeline, returning it along with its event stream.
	pub fn new(config: PipelineConfig, sinks: Sinks) -> (Self, mpsc::UnboundedReceiver<Event>) {
		let (events, rx) = mpsc::unbounded_channel();

		let shared = Shared::default();
		shared.extract.store(config.extract_metadata, Ordering::Relaxed);

		let pipeline = Self {
			config,
			sinks: Some(sinks),
			state: Default::default(),
			stats: StatsTracker::new(),
			shared: Arc::new(shared),
			events,
			closed: None,
			task: None,
		};

		(pipeline, rx)
	}

	pub fn state(&self) -> PipelineState {
		*self.state.lock()
	}

	/// Connect to the configured WebSocket URL and start streaming.
	///
	/// Fails without ever reaching [PipelineState::Streaming] if the URL is invalid,
	/// there is no video decoder, or the connection can't be established.
	pub async fn start(&mut self) -> Result<()> {
		self.check_startable()?;

		let url = self.config.url.clone().ok_or(Error::MissingUrl)?;
		match url.scheme() {
			"ws" | "wss" => {}
			scheme => return Err(Error::Scheme(scheme.to_string())),
		}

		self.set_state(PipelineState::Connecting);
		tracing::info!(%url, format = %self.config.format, framing = self.config.framing, "connecting");

		let chunks = match transport::connect(&url).await {
			Ok(chunks) => chunks,
			Err(err) => {
				self.set_state(PipelineState::Faulted);
				return Err(Error::Transport(Arc::new(err)));
			}
		};

		self.spawn(chunks)
	}

	/// Start streaming from any source of chunks instead of a WebSocket.
	pub fn start_with<S>(&mut self, chunks: S) -> Result<()>
	where
		S: futures::Stream<Item = anyhow::Result<Bytes>> + Send + 'static,
	{
		self.check_startable()?;
		self.spawn(chunks.boxed())
	}

	fn check_startable(&self) -> Result<()> {
		let sinks = self.sinks.as_ref().ok_or(Error::AlreadyStarted)?;
		if self.state() != PipelineState::Idle {
			return Err(Error::AlreadyStarted);
		}
		if sinks.hardware.is_none() && sinks.worker.is_none() {
			return Err(Error::NoDecoder);
		}
		Ok(())
	}

	fn spawn(&mut self, chunks: BoxStream<'static, anyhow::Result<Bytes>>) -> Result<()> {
		let sinks = self.sinks.take().ok_or(Error::AlreadyStarted)?;
		let (output, decoded) = Output::new();

		let session = Session::new(
			self.config.clone(),
			sinks,
			output,
			self.events.clone(),
			self.stats.clone(),
			self.shared.clone(),
		)?;

		let (closed, closed_rx) = oneshot::channel();
		self.closed = Some(closed);

		self.set_state(PipelineState::Streaming);
		let _ = self.events.send(Event::Ready);

		self.task = Some(tokio::spawn(run(session, chunks, decoded, closed_rx, self.state.clone())));
		Ok(())
	}

	/// Stop the pipeline, closing the transport and the decoders.
	///
	/// Safe to call in any state, any number of times.
	pub async fn stop(&mut self) {
		self.closed.take();
		self.sinks.take();

		if let Some(task) = self.task.take() {
			if let Err(err) = task.await {
				tracing::warn!(%err, "pipeline task failed");
			}
		}

		let mut state = self.state.lock();
		if *state != PipelineState::Faulted {
			*state = PipelineState::Stopped;
		}
	}

	/// Wait for the pipeline to stop on its own, when the transport closes or a fault occurs.
	pub async fn closed(&mut self) {
		if let Some(task) = self.task.take() {
			if let Err(err) = task.await {
				tracing::warn!(%err, "pipeline task failed");
			}
		}
	}

	pub fn stats(&self) -> Stats {
		self.stats.query()
	}

	pub fn enable_metadata_extraction(&self) {
		self.shared.extract.store(true, Ordering::Relaxed);
	}

	pub fn disable_metadata_extraction(&self) {
		self.shared.extract.store(false, Ordering::Relaxed);
	}

	/// The SEI payload types seen so far, sorted.
	pub fn detected_sei_types(&self) -> Vec<u32> {
		self.shared.detected.lock().sei_types.clone()
	}

	/// The private data stream ids seen so far, sorted.
	pub fn detected_private_data_ids(&self) -> Vec<u16> {
		self.shared.detected.lock().private_ids.clone()
	}

	fn set_state(&self, state: PipelineState) {
		tracing::debug!(?state, "pipeline state");
		*self.state.lock() = state;
	}
}

async fn run(
	mut session: Session,
	mut chunks: BoxStream<'static, anyhow::Result<Bytes>>,
	mut decoded: mpsc::UnboundedReceiver<Decoded>,
	mut closed: oneshot::Receiver<()>,
	state: Arc<Mutex<PipelineState>>,
) {
	let end = loop {
		tokio::select! {
			biased;
			// The sender was dropped, which means [Pipeline::stop] was called.
			_ = &mut closed => break PipelineState::Stopped,
			Some(output) = decoded.recv() => session.output(output).await,
			chunk = chunks.next() => match chunk {
				Some(Ok(chunk)) => {
					if let Err(err) = session.chunk(chunk).await {
						tracing::warn!(%err, "pipeline faulted");
						session.emit(Event::Error(err.to_string()));
						break PipelineState::Faulted;
					}
				}
				Some(Err(err)) => {
					tracing::warn!(%err, "transport failed");
					session.emit(Event::Network(format!("{err:#}")));
					break PipelineState::Faulted;
				}
				None => {
					tracing::info!("transport closed");
					session.finish().await;

					while let Ok(output) = decoded.try_recv() {
						session.output(output).await;
					}

					session.emit(Event::Network("closed".to_string()));
					break PipelineState::Stopped;
				}
			},
		}
	};

	session.close().await;
	*state.lock() = end;
}
