use balance::Sample;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed mid-handshake")]
    TruncatedHandshake,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("bad host count {0:?}")]
    BadHostCount(String),
    #[error("bad initial power {0:?}")]
    BadInitialPower(String),
    #[error("expected 7 sample fields, got {0}")]
    BadFieldCount(usize),
    #[error("bad sample field {0:?}")]
    BadSampleField(String),
}

/// The three-line preamble a job sends on connect.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub host_count: u32,
    pub initial_power: f64,
    pub profile: String,
}

impl Handshake {
    /// Assemble the handshake from its three wire lines: a positive host
    /// count, a finite measured power, and a free-form profile string.
    pub fn from_lines(
        host_count: &str,
        initial_power: &str,
        profile: &str,
    ) -> Result<Self, ProtocolError> {
        let hosts: u32 = host_count
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadHostCount(host_count.to_string()))?;
        if hosts == 0 {
            return Err(ProtocolError::BadHostCount(host_count.to_string()));
        }
        let power: f64 = initial_power
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadInitialPower(initial_power.to_string()))?;
        if !power.is_finite() {
            return Err(ProtocolError::BadInitialPower(initial_power.to_string()));
        }
        Ok(Self {
            host_count: hosts,
            initial_power: power,
            profile: profile.to_string(),
        })
    }
}

/// Decode one per-tick sample record:
/// `power,epoch,epochCap,epochDur,progress,progressCap,progressDur`.
/// Every field is a decimal float and NaN is a legal value; NaN simply
/// disables whatever that field would have updated.
pub fn parse_sample(line: &str) -> Result<Sample, ProtocolError> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 7 {
        return Err(ProtocolError::BadFieldCount(fields.len()));
    }
    let mut values = [0.0f64; 7];
    for (slot, field) in values.iter_mut().zip(&fields) {
        *slot = field
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadSampleField(field.to_string()))?;
    }
    Ok(Sample {
        power: values[0],
        epoch: values[1],
        epoch_cap: values[2],
        epoch_duration: values[3],
        progress: values[4],
        progress_cap: values[5],
        progress_duration: values[6],
    })
}
