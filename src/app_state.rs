use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::InferenceEngine;
use crate::types::GenerateResponse;

/// Process-wide state: the loaded engine and the console echo.
pub struct AppState {
    pub engine: Arc<dyn InferenceEngine>,
    pub console: ConsoleEcho,
}

impl AppState {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            console: ConsoleEcho::stdout(),
        }
    }
}

/// Writes every response, one JSON object per line. Lines never interleave.
pub struct ConsoleEcho {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleEcho {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn emit(&self, response: &GenerateResponse) -> std::io::Result<()> {
        let line = serde_json::to_string(response)?;
        let mut sink = self.sink.lock();
        writeln!(sink, "{line}")?;
        sink.flush()
    }
}
