//! Core library for controlling multi-channel SCPI bench power supplies.
//!
//! Operations such as connect, apply settings or restore a saved configuration
//! are broken into ordered steps and run by a per-session Tokio task, so the
//! caller never blocks on instrument I/O. Every step talks to the instrument
//! through a [`transport::Transport`]: the built-in simulator, a serial port,
//! or a VISA resource.
//!
//! ```no_run
//! use bench_psu::config::Settings;
//! use bench_psu::operation::OperationRequest;
//! use bench_psu::session::Session;
//! use bench_psu::transport::TransportSpec;
//!
//! # async fn demo() -> bench_psu::error::PsuResult<()> {
//! let settings = Settings::load()?;
//! let session = Session::spawn(&settings.session);
//! session
//!     .run(OperationRequest::connect(TransportSpec::Simulated, 1)?)
//!     .await?;
//! let report = session
//!     .run(OperationRequest::apply_settings_text(2, "5.0", "0.2", "protected")?)
//!     .await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod console;
pub mod driver;
pub mod error;
pub mod operation;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod transport;
