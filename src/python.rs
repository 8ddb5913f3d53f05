//! Python bindings for the analog input driver.

use pyo3::exceptions::{
    PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::analog_input::{AnalogInput, EventTarget};
use crate::errors::{DriverError, ErrorKind};
use crate::logging;
use crate::range::InputRange;
use crate::state::SamplesToLog;
use crate::stream::StreamFrame;
use crate::transport::SerialSettings;

fn to_py_err(err: DriverError) -> PyErr {
    let msg = err.to_string();
    match err.kind() {
        ErrorKind::InvalidRange
        | ErrorKind::OutOfRange
        | ErrorKind::UnknownRange
        | ErrorKind::InvalidChannel
        | ErrorKind::WrongChannelCount
        | ErrorKind::InvalidFlag
        | ErrorKind::Config => PyValueError::new_err(msg),
        ErrorKind::Handshake | ErrorKind::NotConnected => PyConnectionError::new_err(msg),
        ErrorKind::TransportTimeout => PyTimeoutError::new_err(msg),
        ErrorKind::Io | ErrorKind::Serial | ErrorKind::Decode => PyIOError::new_err(msg),
        ErrorKind::RejectedByDevice
        | ErrorKind::NoAcknowledgment
        | ErrorKind::StreamingActive
        | ErrorKind::NotStreaming
        | ErrorKind::NeedsResync => PyRuntimeError::new_err(msg),
    }
}

/// One USB stream frame.
///
/// Attributes:
///     prefix: First prefix byte (stream prefix, or an injected sync byte).
///     sync: Second prefix byte (0, or the sync data).
///     samples: Raw codes, one per streamed channel.
///     volts: Samples converted with the channel ranges at read time.
#[pyclass(name = "StreamFrame", frozen)]
#[derive(Clone)]
struct PyStreamFrame {
    #[pyo3(get)]
    prefix: u8,
    #[pyo3(get)]
    sync: u8,
    #[pyo3(get)]
    samples: Vec<u16>,
    #[pyo3(get)]
    volts: Vec<f64>,
}

#[pymethods]
impl PyStreamFrame {
    fn __repr__(&self) -> String {
        format!(
            "StreamFrame(prefix={}, sync={}, samples={:?})",
            self.prefix, self.sync, self.samples
        )
    }
}

impl PyStreamFrame {
    fn new(frame: StreamFrame, volts: Vec<f64>) -> Self {
        Self {
            prefix: frame.prefix,
            sync: frame.sync,
            samples: frame.samples,
            volts,
        }
    }
}

/// Analog input module driver.
///
/// Example:
///     >>> ai = AnalogInput("/dev/ttyACM0")
///     >>> ai.input_ranges = ["-5V:5V"] * 8
///     >>> ai.set_channel_threshold(0, 2.5)
///     >>> ai.start_usb_stream()
///     >>> frame = ai.read_frame()
///     >>> ai.stop_usb_stream()
#[pyclass(name = "AnalogInput", unsendable)]
struct PyAnalogInput {
    inner: AnalogInput,
}

fn target(name: &str) -> PyResult<EventTarget> {
    match name {
        "sm" | "state_machine" => Ok(EventTarget::StateMachine),
        "usb" => Ok(EventTarget::Usb),
        other => Err(PyValueError::new_err(format!(
            "unknown event target {other:?} (use 'sm' or 'usb')"
        ))),
    }
}

#[pymethods]
impl PyAnalogInput {
    /// Open the serial port and handshake. With no port, an unbound session
    /// stages configuration until `bind()` is called.
    #[new]
    #[pyo3(signature = (port=None, timeout_ms=1000))]
    fn new(port: Option<&str>, timeout_ms: u64) -> PyResult<Self> {
        let inner = match port {
            Some(port) => {
                let mut settings = SerialSettings::new(port);
                settings.timeout = std::time::Duration::from_millis(timeout_ms);
                AnalogInput::open_serial(&settings).map_err(to_py_err)?
            }
            None => AnalogInput::new(),
        };
        Ok(Self { inner })
    }

    /// Bind an unbound session to a serial port and send the staged configuration.
    fn bind(&mut self, port: &str) -> PyResult<()> {
        let settings = SerialSettings::new(port);
        let transport = settings.open().map_err(to_py_err)?;
        self.inner.bind(transport).map(|_| ()).map_err(to_py_err)
    }

    fn resync(&mut self) -> PyResult<()> {
        self.inner.resync().map(|_| ()).map_err(to_py_err)
    }

    fn close(&mut self) -> PyResult<()> {
        self.inner.close().map(|_| ()).map_err(to_py_err)
    }

    #[getter]
    fn firmware_version(&self) -> Option<u32> {
        self.inner.firmware_version()
    }

    #[getter]
    fn n_active_channels(&self) -> u8 {
        self.inner.state().n_active_channels
    }

    #[setter]
    fn set_n_active_channels(&mut self, n: u8) -> PyResult<()> {
        self.inner.set_n_active_channels(n).map_err(to_py_err)
    }

    #[getter]
    fn sampling_rate(&self) -> u32 {
        self.inner.state().sampling_rate_hz
    }

    #[setter]
    fn set_sampling_rate(&mut self, hz: u32) -> PyResult<()> {
        self.inner.set_sampling_rate(hz).map_err(to_py_err)
    }

    #[getter]
    fn input_ranges(&self) -> Vec<&'static str> {
        self.inner.state().ranges().map(InputRange::name).to_vec()
    }

    #[setter]
    fn set_input_ranges(&mut self, names: Vec<String>) -> PyResult<()> {
        self.inner.set_input_range_names(&names).map_err(to_py_err)
    }

    #[getter]
    fn thresholds(&self) -> Vec<f64> {
        self.inner.state().thresholds().to_vec()
    }

    #[setter]
    fn set_thresholds(&mut self, volts: Vec<f64>) -> PyResult<()> {
        self.inner.set_thresholds(&volts).map_err(to_py_err)
    }

    #[getter]
    fn resets(&self) -> Vec<f64> {
        self.inner.state().resets().to_vec()
    }

    #[setter]
    fn set_resets(&mut self, volts: Vec<f64>) -> PyResult<()> {
        self.inner.set_resets(&volts).map_err(to_py_err)
    }

    #[getter]
    fn sm_events(&self) -> Vec<u8> {
        self.inner.state().sm_events().to_bytes().to_vec()
    }

    #[setter]
    fn set_sm_events(&mut self, flags: Vec<u8>) -> PyResult<()> {
        self.inner.set_sm_events(&flags).map_err(to_py_err)
    }

    #[getter]
    fn stream_to_usb(&self) -> Vec<u8> {
        self.inner.state().usb_routing().to_bytes().to_vec()
    }

    #[setter]
    fn set_stream_to_usb(&mut self, flags: Vec<u8>) -> PyResult<()> {
        self.inner.set_usb_routing(&flags).map_err(to_py_err)
    }

    #[getter]
    fn stream_to_module(&self) -> Vec<u8> {
        self.inner.state().module_routing().to_bytes().to_vec()
    }

    #[setter]
    fn set_stream_to_module(&mut self, flags: Vec<u8>) -> PyResult<()> {
        self.inner.set_module_routing(&flags).map_err(to_py_err)
    }

    #[getter]
    fn stream_prefix(&self) -> u8 {
        self.inner.state().stream_prefix
    }

    #[setter]
    fn set_stream_prefix(&mut self, prefix: u8) -> PyResult<()> {
        self.inner.set_stream_prefix(prefix).map_err(to_py_err)
    }

    /// Samples to log; `None` means unbounded.
    #[getter]
    fn samples_to_log(&self) -> Option<u32> {
        match self.inner.state().samples_to_log {
            SamplesToLog::Unbounded => None,
            SamplesToLog::Limited(n) => Some(n),
        }
    }

    #[setter]
    fn set_samples_to_log(&mut self, n: Option<u32>) -> PyResult<()> {
        let samples = n.map_or(SamplesToLog::Unbounded, SamplesToLog::Limited);
        self.inner.set_samples_to_log(samples).map_err(to_py_err)
    }

    fn set_channel_range(&mut self, channel: usize, name: &str) -> PyResult<()> {
        let range: InputRange = name.parse().map_err(to_py_err)?;
        self.inner
            .set_channel_range(channel, range)
            .map_err(to_py_err)
    }

    fn set_channel_threshold(&mut self, channel: usize, volts: f64) -> PyResult<()> {
        self.inner
            .set_channel_threshold(channel, volts)
            .map_err(to_py_err)
    }

    fn set_channel_reset(&mut self, channel: usize, volts: f64) -> PyResult<()> {
        self.inner
            .set_channel_reset(channel, volts)
            .map_err(to_py_err)
    }

    fn set_channel_sm_event(&mut self, channel: usize, enabled: bool) -> PyResult<()> {
        self.inner
            .set_channel_sm_event(channel, enabled)
            .map_err(to_py_err)
    }

    fn start_usb_stream(&mut self) -> PyResult<()> {
        self.inner.start_usb_stream().map_err(to_py_err)
    }

    fn stop_usb_stream(&mut self) -> PyResult<()> {
        self.inner.stop_usb_stream().map_err(to_py_err)
    }

    fn start_module_stream(&mut self) -> PyResult<()> {
        self.inner.start_module_stream().map_err(to_py_err)
    }

    fn stop_module_stream(&mut self) -> PyResult<()> {
        self.inner.stop_module_stream().map_err(to_py_err)
    }

    /// Start threshold event reporting to `"sm"` (state machine) or `"usb"`.
    #[pyo3(signature = (to="sm"))]
    fn start_reporting_events(&mut self, to: &str) -> PyResult<()> {
        self.inner
            .start_event_reporting(target(to)?)
            .map_err(to_py_err)
    }

    #[pyo3(signature = (to="sm"))]
    fn stop_reporting_events(&mut self, to: &str) -> PyResult<()> {
        self.inner
            .stop_event_reporting(target(to)?)
            .map_err(to_py_err)
    }

    fn start_logging(&mut self) -> PyResult<()> {
        self.inner.start_logging().map_err(to_py_err)
    }

    fn stop_logging(&mut self) -> PyResult<()> {
        self.inner.stop_logging().map_err(to_py_err)
    }

    fn zero(&mut self) -> PyResult<()> {
        self.inner.zero().map_err(to_py_err)
    }

    /// Read one USB stream frame (blocks up to the port timeout).
    fn read_frame(&mut self) -> PyResult<PyStreamFrame> {
        let frame = self.inner.read_stream_frame().map_err(to_py_err)?;
        let volts = self.inner.frame_volts(&frame);
        Ok(PyStreamFrame::new(frame, volts))
    }

    /// Download logged samples as a dict with `codes` and `volts`, one list per channel.
    fn get_logged_data<'py>(&mut self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let data = self.inner.get_logged_data().map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("n_samples", data.n_samples())?;
        dict.set_item("codes", data.codes)?;
        dict.set_item("volts", data.volts)?;
        Ok(dict)
    }

    /// Current configuration as TOML text.
    fn config_toml(&self) -> PyResult<String> {
        self.inner.config().to_toml_string().map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "AnalogInput(state={:?}, channels={}, rate={}Hz)",
            self.inner.lifecycle(),
            self.inner.state().n_active_channels,
            self.inner.state().sampling_rate_hz
        )
    }
}

/// Route Rust logs to Python's `logging` at the given level (or the env default).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level(py, level)
}

#[pymodule]
#[pyo3(name = "_core")]
fn core_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;
    m.add_class::<PyAnalogInput>()?;
    m.add_class::<PyStreamFrame>()?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add(
        "INPUT_RANGES",
        InputRange::ALL.map(InputRange::name).to_vec(),
    )?;
    m.add("MAX_SAMPLING_RATE", crate::state::MAX_SAMPLING_RATE)?;
    Ok(())
}
