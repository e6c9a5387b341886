//! Member decoding: inflate, structural decode, analytics hand-off.
//!
//! The record-level MRO/MDT statistics are not this crate's business; the
//! decoders here enforce the structural contract (bytes in, row stream
//! out, `ParseError` on bad input) and the [`AnalyticsSink`] seam carries
//! rows to the columnar store. Writes must stay idempotent at the
//! `(FileHash, SubFileName)` grain because delivery is at-least-once.

use std::collections::HashMap;
use std::io::Read;

use async_trait::async_trait;
use flate2::read::DeflateDecoder;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::backend::{DataType, NdsFileRecord};
use crate::error::{NdsError, Result};
use crate::zip::CompressionMethod;

const MODULE: &str = "worker.decode";

/// One decoded measurement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeasurementRow {
    /// Measured object (cell / UE context) the row belongs to.
    pub object_id: String,
    /// Raw value columns in file order.
    pub values: Vec<String>,
}

/// Structural decoder for one member class.
pub trait MemberDecoder: Send + Sync {
    /// # Errors
    ///
    /// `ParseError` when the input does not match the member's format.
    fn decode(&self, data: &[u8]) -> Result<Vec<MeasurementRow>>;
}

/// MRO members: XML, measurement values in `<v>` elements grouped under
/// `<object id="...">`.
pub struct MroXmlDecoder;

impl MemberDecoder for MroXmlDecoder {
    fn decode(&self, data: &[u8]) -> Result<Vec<MeasurementRow>> {
        let text = std::str::from_utf8(data)
            .map_err(|e| NdsError::parse(MODULE, format!("mro xml is not utf-8: {e}")))?;
        let mut reader = Reader::from_str(text);

        let mut rows = Vec::new();
        let mut object_id = String::new();
        let mut in_value = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) => match element.name().as_ref() {
                    b"object" => {
                        object_id = element
                            .try_get_attribute("id")
                            .map_err(|e| NdsError::parse(MODULE, format!("bad object attr: {e}")))?
                            .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
                            .unwrap_or_default();
                    }
                    b"v" => in_value = true,
                    _ => {}
                },
                Ok(Event::End(element)) => {
                    if element.name().as_ref() == b"v" {
                        in_value = false;
                    }
                }
                Ok(Event::Text(text)) if in_value => {
                    let raw = text
                        .unescape()
                        .map_err(|e| NdsError::parse(MODULE, format!("bad text node: {e}")))?;
                    let values: Vec<String> =
                        raw.split_whitespace().map(str::to_string).collect();
                    if !values.is_empty() {
                        rows.push(MeasurementRow { object_id: object_id.clone(), values });
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(NdsError::parse(MODULE, format!("mro xml: {e}"))),
            }
        }
        Ok(rows)
    }
}

/// MDT members: headed CSV, one measurement per record.
pub struct MdtCsvDecoder;

impl MemberDecoder for MdtCsvDecoder {
    fn decode(&self, data: &[u8]) -> Result<Vec<MeasurementRow>> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(data);
        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| NdsError::parse(MODULE, format!("mdt csv: {e}")))?;
            let values: Vec<String> = record.iter().map(str::to_string).collect();
            if values.is_empty() {
                continue;
            }
            let object_id =
                values.first().cloned().unwrap_or_else(|| index.to_string());
            rows.push(MeasurementRow { object_id, values });
        }
        Ok(rows)
    }
}

/// Decoder for a task's member class.
pub fn decoder_for(data_type: DataType) -> &'static dyn MemberDecoder {
    match data_type {
        DataType::Mro => &MroXmlDecoder,
        DataType::Mdt => &MdtCsvDecoder,
    }
}

/// Expand a member's raw bytes per its recorded compression method.
///
/// ZIP deflate is raw RFC 1951, no zlib or gzip wrapper.
pub fn inflate(data: &[u8], compress_type: u16) -> Result<Vec<u8>> {
    match CompressionMethod::from_u16(compress_type) {
        CompressionMethod::Stored => Ok(data.to_vec()),
        CompressionMethod::Deflate => {
            let mut decoder = DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| NdsError::parse(MODULE, format!("deflate: {e}")))?;
            Ok(out)
        }
        CompressionMethod::Unknown(method) => {
            Err(NdsError::parse(MODULE, format!("unsupported compression method {method}")))
        }
    }
}

/// Destination for decoded rows.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Bulk-insert one member's rows. Must be idempotent per
    /// `(FileHash, SubFileName)`: redelivery after a lease expiry replays
    /// the same rows.
    async fn insert(&self, task: &NdsFileRecord, rows: &[MeasurementRow]) -> Result<()>;
}

/// Posts row batches to the analytics store's HTTP ingest endpoint.
pub struct HttpAnalyticsSink {
    url: String,
    http: Client,
}

impl HttpAnalyticsSink {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(3600))
            .build()
            .map_err(|e| NdsError::io(MODULE, format!("http client: {e}")))?;
        Ok(Self { url: url.to_string(), http })
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn insert(&self, task: &NdsFileRecord, rows: &[MeasurementRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let body = json!({
            "FileHash": task.file_hash,
            "NDSID": task.nds_id,
            "SubFileName": task.sub_file_name,
            "DataType": task.data_type,
            "FileTime": task.file_time,
            "eNodeBID": task.enodeb_id,
            "rows": rows,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NdsError::io(MODULE, format!("analytics insert: {e}")))?;
        if !resp.status().is_success() {
            return Err(NdsError::io(MODULE, format!("analytics insert: status {}", resp.status())));
        }
        Ok(())
    }
}

/// Counts rows and logs; stands in when no analytics endpoint is
/// configured so the rest of the pipeline stays exercisable.
#[derive(Default)]
pub struct DiscardSink {
    inserted: std::sync::Mutex<HashMap<String, usize>>,
}

impl DiscardSink {
    pub fn inserted_rows(&self, file_hash: &str) -> usize {
        self.inserted.lock().unwrap().get(file_hash).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AnalyticsSink for DiscardSink {
    async fn insert(&self, task: &NdsFileRecord, rows: &[MeasurementRow]) -> Result<()> {
        debug!(module = MODULE, file = %task.sub_file_name, rows = rows.len(), "rows discarded");
        *self.inserted.lock().unwrap().entry(task.file_hash.clone()).or_insert(0) += rows.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    const MRO_SAMPLE: &str = r#"<?xml version="1.0"?>
<measurement>
  <smr>MR.LteScRSRP MR.LteScRSRQ</smr>
  <object id="292551-1" MmeCode="1">
    <v>-95 -10</v>
    <v>-101 -13</v>
  </object>
  <object id="292551-2">
    <v>-88 -9</v>
  </object>
</measurement>"#;

    #[test]
    fn mro_decoder_groups_rows_by_object() {
        let rows = MroXmlDecoder.decode(MRO_SAMPLE.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].object_id, "292551-1");
        assert_eq!(rows[0].values, vec!["-95", "-10"]);
        assert_eq!(rows[2].object_id, "292551-2");
    }

    #[test]
    fn mro_decoder_rejects_broken_xml() {
        let err = MroXmlDecoder.decode(b"<measurement><object").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn mdt_decoder_reads_headed_csv() {
        let data = b"MME_UE_S1AP_ID,Longitude,Latitude,RSRP\n1001,116.39,39.90,-98\n1002,116.40,39.91,-87\n";
        let rows = MdtCsvDecoder.decode(data).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].object_id, "1001");
        assert_eq!(rows[1].values[3], "-87");
    }

    #[test]
    fn inflate_handles_stored_and_deflate() {
        let payload = b"measurement payload".to_vec();
        assert_eq!(inflate(&payload, 0).unwrap(), payload);

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(inflate(&compressed, 8).unwrap(), payload);
    }

    #[test]
    fn inflate_rejects_unknown_methods_and_garbage() {
        assert_eq!(inflate(b"x", 99).unwrap_err().kind, ErrorKind::ParseError);
        assert_eq!(inflate(b"definitely not deflate", 8).unwrap_err().kind, ErrorKind::ParseError);
    }

    #[tokio::test]
    async fn discard_sink_counts_per_file_hash() {
        let task = NdsFileRecord {
            file_hash: "abc".into(),
            nds_id: 7,
            file_path: "/mro/a.zip".into(),
            sub_file_name: "a.xml".into(),
            header_offset: 0,
            compress_size: 0,
            file_size: 0,
            flag_bits: 0,
            compress_type: 0,
            data_type: DataType::Mro,
            enodeb_id: 0,
            file_time: "2024-12-20 02:30:00".into(),
            parsed: 1,
        };
        let rows = MroXmlDecoder.decode(MRO_SAMPLE.as_bytes()).unwrap();
        let sink = DiscardSink::default();
        sink.insert(&task, &rows).await.unwrap();
        sink.insert(&task, &rows).await.unwrap();
        assert_eq!(sink.inserted_rows("abc"), rows.len() * 2);
        assert_eq!(sink.inserted_rows("other"), 0);
    }
}
