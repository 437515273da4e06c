//! Print hook: dump samples through the human-readable line codec.
//!
//! Output goes to stdout or to a file given by the `output` setting. File
//! writes go through a buffered writer so the hot path never waits on raw
//! syscalls; the buffer is flushed on stop and at the periodic tick.

use std::fs::File;
use std::io::{BufWriter, Write};

use log::error;

use crate::error::Result;
use crate::format::HumanFormat;
use crate::hook::{Hook, Verdict};
use crate::sample::SampleRef;
use crate::signal::SignalList;

pub struct PrintHook {
    prefix: Option<String>,
    output: Option<String>,
    writer: Option<BufWriter<File>>,
    format: Option<HumanFormat>,
}

impl PrintHook {
    pub fn new() -> Self {
        PrintHook {
            prefix: None,
            output: None,
            writer: None,
            format: None,
        }
    }
}

impl Default for PrintHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for PrintHook {
    fn name(&self) -> &'static str {
        "print"
    }

    fn parse(&mut self, cfg: &serde_json::Value) -> Result<()> {
        self.prefix = cfg
            .get("prefix")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        self.output = cfg
            .get("output")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(())
    }

    fn prepare(&mut self, signals: SignalList) -> Result<SignalList> {
        self.format = Some(HumanFormat::new(signals.clone()));
        Ok(signals)
    }

    fn start(&mut self) {
        if let Some(path) = &self.output {
            match File::create(path) {
                Ok(f) => self.writer = Some(BufWriter::new(f)),
                Err(e) => error!("print hook cannot open '{}': {}", path, e),
            }
        }
    }

    fn stop(&mut self) {
        if let Some(w) = &mut self.writer {
            let _ = w.flush();
        }
        self.writer = None;
    }

    fn periodic(&mut self) {
        if let Some(w) = &mut self.writer {
            let _ = w.flush();
        }
    }

    fn process(&mut self, smp: &mut SampleRef) -> Verdict {
        let format = match &self.format {
            Some(f) => f,
            None => return Verdict::Ok, // not prepared; nothing to print with
        };

        let line = format.print_single(smp);
        let prefix = self.prefix.as_deref().unwrap_or("");

        let result = match &mut self.writer {
            Some(w) => write!(w, "{}{}", prefix, line),
            None => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                write!(lock, "{}{}", prefix, line)
            }
        };

        match result {
            Ok(()) => Verdict::Ok,
            Err(e) => {
                error!("print hook write failed: {}", e);
                Verdict::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryType, Pool};
    use crate::sample::flags;
    use crate::signal::{signal_list_generate, SignalData, SignalType};
    use crate::timing::Timestamp;

    #[test]
    fn test_writes_lines_to_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("sigflow-print-hook-{}.log", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();

        let signals = signal_list_generate(1, SignalType::Float);
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();

        let mut hook = PrintHook::new();
        hook.parse(&serde_json::json!({ "prefix": "dbg: ", "output": path_str }))
            .unwrap();
        hook.prepare(signals.clone()).unwrap();
        hook.start();

        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = 3;
            s.ts_origin = Timestamp::new(1, 0);
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_DATA;
            s.signals = Some(signals);
            s.set_len(1);
            s.data_mut()[0] = SignalData::float(2.5);
        }

        assert_eq!(hook.process(&mut smp), Verdict::Ok);
        hook.stop();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "dbg: 1.000000000(3)\t2.5\n");
        let _ = std::fs::remove_file(&path);
    }
}
