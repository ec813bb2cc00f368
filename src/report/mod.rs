//! Stored oximetry sessions.
//!
//! A [`Report`] keeps only what the device sent, as hex: the 10-byte
//! header and the raw sample stream. Everything else (timestamps, mode,
//! sample arrays) is derived on demand through [`decoder`].

pub mod decoder;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub use decoder::{
    decode_header, decode_samples, DecodeError, HeaderInfo, Mode, Result, Samples, HEADER_LEN,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub number: u16,
    pub header: String,
    pub data: String,
}

impl Report {
    pub fn new(number: u16, header: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            number,
            header: header.into(),
            data: data.into(),
        }
    }

    /// A report whose data has not been fetched yet.
    pub fn from_header(number: u16, header: &[u8]) -> Self {
        Self::new(number, hex::encode(header), String::new())
    }

    pub fn set_data(&mut self, samples: &[u8]) {
        self.data = hex::encode(samples);
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn header_info(&self) -> Result<HeaderInfo> {
        decode_header(&hex::decode(&self.header)?)
    }

    pub fn start(&self) -> Result<NaiveDateTime> {
        Ok(self.header_info()?.start)
    }

    pub fn end(&self) -> Result<NaiveDateTime> {
        Ok(self.header_info()?.end)
    }

    pub fn interval_seconds(&self) -> Result<u8> {
        Ok(self.header_info()?.interval_seconds)
    }

    pub fn mode(&self) -> Result<Mode> {
        Ok(self.header_info()?.mode)
    }

    pub fn duration(&self) -> Result<Duration> {
        let info = self.header_info()?;
        Ok(info.end - info.start)
    }

    /// Decoded sample stream. Empty until the data has been fetched.
    pub fn samples(&self) -> Result<Samples> {
        Ok(decode_samples(&hex::decode(&self.data)?))
    }

    pub fn sp02(&self) -> Result<Vec<u8>> {
        Ok(self.samples()?.sp02)
    }

    pub fn pulse(&self) -> Result<Vec<u8>> {
        Ok(self.samples()?.pulse)
    }

    pub fn summary(&self) -> Result<ReportSummary> {
        let info = self.header_info()?;
        Ok(ReportSummary {
            number: self.number,
            start: info.start,
            end: info.end,
            duration_seconds: (info.end - info.start).num_seconds(),
            interval_seconds: info.interval_seconds,
            mode: info.mode,
            sample_count: self.samples()?.len(),
        })
    }
}

/// Flattened view of a report for display and export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub number: u16,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub duration_seconds: i64,
    pub interval_seconds: u8,
    pub mode: Mode,
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn reference() -> Report {
        Report::new(1, "14060112993005220012", "5e00325e0037")
    }

    #[test]
    fn test_derived_fields() {
        let report = reference();
        let start = NaiveDate::from_ymd_opt(2014, 6, 1)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap();
        assert_eq!(report.start().unwrap(), start);
        assert_eq!(report.end().unwrap(), start + Duration::seconds(25));
        assert_eq!(report.duration().unwrap(), Duration::seconds(25));
        assert_eq!(report.interval_seconds().unwrap(), 5);
        assert_eq!(report.mode().unwrap(), Mode::Adult);
        assert_eq!(report.sp02().unwrap(), vec![0x5e, 0x5e]);
        assert_eq!(report.pulse().unwrap(), vec![0x32, 0x37]);
    }

    #[test]
    fn test_header_then_data() {
        let header = hex::decode("14060112993005420012").unwrap();
        let mut report = Report::from_header(3, &header);
        assert_eq!(report.number, 3);
        assert!(!report.has_data());
        assert!(report.samples().unwrap().is_empty());
        assert_eq!(report.mode().unwrap(), Mode::Pediatric);

        report.set_data(&[0x60, 0x00, 0x48]);
        assert!(report.has_data());
        assert_eq!(report.data, "600048");
        assert_eq!(report.sp02().unwrap(), vec![0x60]);
    }

    #[test]
    fn test_summary() {
        let summary = reference().summary().unwrap();
        assert_eq!(summary.number, 1);
        assert_eq!(summary.duration_seconds, 25);
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.mode, Mode::Adult);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["start"], "2014-06-01T12:30:05");
        assert_eq!(json["mode"], "Adult");
    }

    #[test]
    fn test_bad_hex_is_reported() {
        let report = Report::new(1, "zz", "");
        assert!(matches!(report.start(), Err(DecodeError::InvalidHex(_))));
    }
}
