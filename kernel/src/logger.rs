//! `log` backend. Lines go to a single registered sink, prefixed with the level and, once the
//! calling core has a state block, its core id.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Once;

use crate::percpu;

/// A line-oriented text output, e.g. a serial port.
pub type Sink = fn(fmt::Arguments<'_>);

pub struct KernelLogger {
    sink: Once<Sink>,
}

static LOGGER: KernelLogger = KernelLogger { sink: Once::new() };

pub fn init(sink: Sink, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.sink.call_once(|| sink);

    log::set_logger(&LOGGER)?;
    log::set_max_level(level);

    Ok(())
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let Some(sink) = self.sink.get() else {
            return;
        };

        let core_id = percpu::try_current().map(|core| core.id());

        sink(format_args!("{}", Line { core_id, record }));
    }

    fn flush(&self) {}
}

struct Line<'a, 'r> {
    core_id: Option<usize>,
    record: &'a Record<'r>,
}

impl fmt::Display for Line<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(core_id) = self.core_id {
            write!(f, "[core {core_id}] ")?;
        }

        let target = self.record.target();
        let target = target.rsplit("::").next().unwrap_or(target);

        write!(f, "{:<5} {target}: {}", self.record.level(), self.record.args())?;
        f.write_char('\n')
    }
}
