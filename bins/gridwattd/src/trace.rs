use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use log::error;

/// Append-only record of every rebalance round:
/// `timestamp,target,cap,measured`, all power columns in cluster-total
/// watts. Write failures are logged once; the coordinator keeps running
/// either way.
pub struct ClusterTrace {
    out: BufWriter<File>,
    write_failed: bool,
}

impl ClusterTrace {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(b"timestamp,target,cap,measured\n")?;
        Ok(Self {
            out,
            write_failed: false,
        })
    }

    pub fn append(&mut self, target: f64, cap: f64, measured: f64) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
        let line = format!("{},{},{},{}\n", stamp, target, cap, measured);
        if let Err(e) = self.out.write_all(line.as_bytes()) {
            if !self.write_failed {
                error!("cluster trace write failed: {}", e);
                self.write_failed = true;
            }
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            if !self.write_failed {
                error!("cluster trace flush failed: {}", e);
                self.write_failed = true;
            }
        }
    }
}
