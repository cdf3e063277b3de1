use std::{net::SocketAddr, time::Duration};

use meter_client::domain::IngestionPoint;
use time::OffsetDateTime;
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::pipeline::PipelineError;

/// Escape measurement/tag keys/tag values/field keys for ILP.
///
/// ILP requires escaping commas, spaces and equals with a backslash.
fn ilp_escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn push_tag(out: &mut String, key: &str, value: &str) {
    out.push(',');
    ilp_escape_ident(key, out);
    out.push('=');
    ilp_escape_ident(value, out);
}

fn push_field_sep(out: &mut String, first: &mut bool) {
    if *first {
        *first = false;
    } else {
        out.push(',');
    }
}

fn push_field_f64(out: &mut String, first: &mut bool, key: &str, value: f64) {
    push_field_sep(out, first);
    ilp_escape_ident(key, out);
    out.push('=');
    out.push_str(&value.to_string());
}

fn push_field_bool(out: &mut String, first: &mut bool, key: &str, value: bool) {
    push_field_sep(out, first);
    ilp_escape_ident(key, out);
    out.push('=');
    out.push(if value { 't' } else { 'f' });
}

fn ts_to_unix_nanos(ts: OffsetDateTime) -> i128 {
    ts.unix_timestamp_nanos()
}

pub trait IlpEncode {
    fn write_ilp_line(&self, out: &mut String);
}

impl IlpEncode for IngestionPoint {
    fn write_ilp_line(&self, out: &mut String) {
        ilp_escape_ident(self.measurement(), out);

        // tags (SYMBOL columns); together with ts they form the point's key
        push_tag(out, "unit", self.unit());
        push_tag(out, "tariff", self.tariff.as_str());

        out.push(' ');
        let mut first = true;
        push_field_f64(out, &mut first, "consumption", self.consumption_kwh);
        push_field_f64(out, &mut first, "power", self.billed_power_kw);
        push_field_bool(out, &mut first, "sun_hours", self.sun_hours);
        push_field_bool(out, &mut first, "power_peak", self.power_peak);

        out.push(' ');
        out.push_str(&ts_to_unix_nanos(self.ts).to_string());
    }
}

pub fn encode_batch<T: IlpEncode>(batch: &[T]) -> Vec<u8> {
    // Heuristic capacity: ~120 bytes per line.
    let mut s = String::with_capacity(batch.len().saturating_mul(120));
    for item in batch {
        item.write_ilp_line(&mut s);
        s.push('\n');
    }
    s.into_bytes()
}

/// Writes point batches to QuestDB over the ILP TCP endpoint, one
/// connection per batch.
pub struct QuestDbIlpWriter {
    addr: SocketAddr,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbIlpWriter {
    pub fn new(addr: SocketAddr, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            addr,
            max_retries,
            retry_backoff,
        }
    }

    async fn connect(&self) -> Result<TcpStream, PipelineError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| PipelineError::Write(format!("failed to connect to QuestDB ILP: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let _ = stream.set_nodelay(true);
        stream.write_all(payload).await?;
        stream.flush().await?;
        // Best-effort: closing the write half makes QuestDB commit the lines.
        let _ = stream.shutdown().await;
        Ok(())
    }

    pub async fn write(&self, points: &[IngestionPoint]) -> Result<(), PipelineError> {
        if points.is_empty() {
            return Ok(());
        }

        let payload = encode_batch(points);

        let mut attempt: u32 = 0;
        loop {
            match self.send(&payload).await {
                Ok(()) => {
                    metrics::counter!("questdb_ingested_records_total").increment(points.len() as u64);
                    metrics::counter!("questdb_ilp_bytes_total").increment(payload.len() as u64);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "QuestDB ILP write failed, reconnecting and retrying"
                    );
                    metrics::counter!("questdb_ilp_retry_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "QuestDB ILP write failed, giving up");
                    metrics::counter!("questdb_sink_errors_total").increment(1);
                    return Err(PipelineError::Write(format!("ilp write failed: {e}")));
                }
            }
        }
    }

    /// Verify the ILP endpoint accepts connections. Used at startup.
    pub async fn probe(&self) -> Result<(), PipelineError> {
        let mut stream = self.connect().await?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}
