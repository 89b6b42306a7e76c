/*!
Binary encoding of mempool snapshots.

File layout, all integers little-endian:

```text
header  : version u16 | magic "MPDT" | compression id u8 | reserved u8
body    : tip [32] | height u64 | captured_at i64
          record count u64, then per record:
            txid [32] | payload len u32 | payload
            entry_time i64 | fee_rate u64 | size u32 | fee_delta i64
            ancestor_count u32 | descendant_count u32
            parent count u32 | parents [32]*
          delta count u64 | (txid [32] | delta i64)*
trailer : stored body length u64 | sha256(header || stored body)
```

The body is stored through the compression adapter named in the header. A
decoder never returns a partial snapshot: every inconsistency is a
[`FormatError`].
*/

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::compression::{adapter_for_id, CompressionAdapter};
use crate::error::FormatError;
use crate::record::{
    from_unix_seconds, EntryMetadata, Hash256, PoolState, Snapshot, TransactionRecord,
    FORMAT_VERSION,
};

pub const MAGIC: [u8; 4] = *b"MPDT";
pub const HEADER_LEN: usize = 8;
pub const TRAILER_LEN: usize = 8 + 32;

/// Smallest possible encoded record (empty payload, no parents)
const MIN_RECORD_LEN: usize = 32 + 4 + 8 + 8 + 4 + 8 + 4 + 4 + 4;
const DELTA_LEN: usize = 32 + 8;

/// Parsed fixed-size file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub compression: u8,
}

/// Encode a snapshot into the complete file image.
pub fn encode(snapshot: &Snapshot, compressor: &dyn CompressionAdapter) -> Result<Bytes, FormatError> {
    if snapshot.version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: snapshot.version,
            supported: FORMAT_VERSION,
        });
    }

    let body = encode_body(snapshot)?;
    let stored = compressor.compress(&body)?;

    let mut out = BytesMut::with_capacity(HEADER_LEN + stored.len() + TRAILER_LEN);
    out.put_u16_le(snapshot.version);
    out.put_slice(&MAGIC);
    out.put_u8(compressor.id());
    out.put_u8(0);
    out.put_slice(&stored);

    let digest = Sha256::digest(&out[..]);
    out.put_u64_le(stored.len() as u64);
    out.put_slice(&digest);

    Ok(out.freeze())
}

fn encode_body(snapshot: &Snapshot) -> Result<BytesMut, FormatError> {
    let mut body = BytesMut::with_capacity(
        32 + 8 + 8 + 8 + snapshot.records.len() * MIN_RECORD_LEN + snapshot.payload_bytes(),
    );

    body.put_slice(snapshot.state.tip.as_bytes());
    body.put_u64_le(snapshot.state.height);
    let captured_at = unix_seconds(&snapshot.captured_at).ok_or_else(|| {
        FormatError::malformed(format!(
            "capture time {} has sub-second precision",
            snapshot.captured_at
        ))
    })?;
    body.put_i64_le(captured_at);

    body.put_u64_le(snapshot.records.len() as u64);
    for record in &snapshot.records {
        put_record(&mut body, record)?;
    }

    body.put_u64_le(snapshot.fee_deltas.len() as u64);
    for (txid, delta) in &snapshot.fee_deltas {
        body.put_slice(txid.as_bytes());
        body.put_i64_le(*delta);
    }

    Ok(body)
}

fn put_record(body: &mut BytesMut, record: &TransactionRecord) -> Result<(), FormatError> {
    let meta = &record.meta;
    let payload_len = u32::try_from(record.payload.len()).map_err(|_| {
        FormatError::malformed(format!("payload of {} too large to encode", meta.txid))
    })?;
    let parent_count = u32::try_from(meta.parents.len()).map_err(|_| {
        FormatError::malformed(format!("too many parents recorded for {}", meta.txid))
    })?;
    let entry_time = unix_seconds(&meta.entry_time).ok_or_else(|| {
        FormatError::malformed(format!(
            "arrival time of {} has sub-second precision",
            meta.txid
        ))
    })?;

    body.put_slice(meta.txid.as_bytes());
    body.put_u32_le(payload_len);
    body.put_slice(&record.payload);
    body.put_i64_le(entry_time);
    body.put_u64_le(meta.fee_rate);
    body.put_u32_le(meta.size);
    body.put_i64_le(meta.fee_delta);
    body.put_u32_le(meta.ancestor_count);
    body.put_u32_le(meta.descendant_count);
    body.put_u32_le(parent_count);
    for parent in &meta.parents {
        body.put_slice(parent.as_bytes());
    }
    Ok(())
}

/// Times are stored as whole seconds; anything finer would not survive a reload
fn unix_seconds(time: &DateTime<Utc>) -> Option<i64> {
    (time.timestamp_subsec_nanos() == 0).then(|| time.timestamp())
}

/// Parse and validate only the fixed header.
pub fn decode_header(data: &[u8]) -> Result<FileHeader, FormatError> {
    if data.len() < HEADER_LEN {
        return Err(FormatError::truncated("header"));
    }
    let mut header = &data[..HEADER_LEN];
    let version = header.get_u16_le();
    let mut magic = [0u8; 4];
    header.copy_to_slice(&mut magic);
    let compression = header.get_u8();

    if magic != MAGIC {
        return Err(FormatError::BadMagic);
    }
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    Ok(FileHeader {
        version,
        compression,
    })
}

/// Decode a complete file image.
pub fn decode(data: &[u8]) -> Result<Snapshot, FormatError> {
    let header = decode_header(data)?;

    if data.len() < HEADER_LEN + TRAILER_LEN {
        return Err(FormatError::truncated("trailer"));
    }
    let trailer_start = data.len() - TRAILER_LEN;
    let mut trailer = &data[trailer_start..];
    let stored_len = trailer.get_u64_le();
    let body_len = trailer_start - HEADER_LEN;
    if stored_len != body_len as u64 {
        return Err(FormatError::truncated(format!(
            "body (trailer records {stored_len} bytes, found {body_len})"
        )));
    }

    let actual = Sha256::digest(&data[..trailer_start]);
    if actual.as_slice() != trailer {
        return Err(FormatError::ChecksumMismatch {
            expected: to_hex(trailer),
            actual: to_hex(&actual),
        });
    }

    let body = adapter_for_id(header.compression)?.decompress(&data[HEADER_LEN..trailer_start])?;
    decode_body(header.version, &body)
}

fn decode_body(version: u16, body: &[u8]) -> Result<Snapshot, FormatError> {
    let mut reader = Reader { buf: body };

    let tip = reader.hash("chain tip")?;
    let height = reader.u64("chain height")?;
    let captured_secs = reader.i64("capture time")?;
    let captured_at = from_unix_seconds(captured_secs)
        .ok_or_else(|| FormatError::malformed(format!("capture time {captured_secs} out of range")))?;

    let record_count = reader.u64("record count")?;
    let mut records = Vec::with_capacity(reader.capacity_hint(record_count, MIN_RECORD_LEN));
    for _ in 0..record_count {
        records.push(reader.record()?);
    }

    let delta_count = reader.u64("fee delta count")?;
    let mut fee_deltas = BTreeMap::new();
    for _ in 0..delta_count {
        let txid = reader.hash("fee delta txid")?;
        let delta = reader.i64("fee delta")?;
        fee_deltas.insert(txid, delta);
    }

    if reader.buf.has_remaining() {
        return Err(FormatError::malformed(format!(
            "{} trailing bytes after fee deltas",
            reader.buf.remaining()
        )));
    }

    Ok(Snapshot {
        version,
        state: PoolState { tip, height },
        captured_at,
        records,
        fee_deltas,
    })
}

/// Bounds-checked cursor over the decompressed body
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &str) -> Result<(), FormatError> {
        if self.buf.remaining() < n {
            return Err(FormatError::truncated(what));
        }
        Ok(())
    }

    /// Never pre-allocate more entries than the remaining bytes could hold
    fn capacity_hint(&self, count: u64, min_len: usize) -> usize {
        let fits = self.buf.remaining() / min_len;
        usize::try_from(count).map_or(fits, |count| count.min(fits))
    }

    fn u32(&mut self, what: &str) -> Result<u32, FormatError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, what: &str) -> Result<u64, FormatError> {
        self.need(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self, what: &str) -> Result<i64, FormatError> {
        self.need(8, what)?;
        Ok(self.buf.get_i64_le())
    }

    fn hash(&mut self, what: &str) -> Result<Hash256, FormatError> {
        self.need(32, what)?;
        let mut out = [0u8; 32];
        self.buf.copy_to_slice(&mut out);
        Ok(Hash256(out))
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<Bytes, FormatError> {
        self.need(len, what)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn record(&mut self) -> Result<TransactionRecord, FormatError> {
        let txid = self.hash("record txid")?;
        let payload_len = self.u32("payload length")? as usize;
        let payload = self.bytes(payload_len, "payload")?;
        let entry_secs = self.i64("entry time")?;
        let entry_time = from_unix_seconds(entry_secs).ok_or_else(|| {
            FormatError::malformed(format!("entry time {entry_secs} of {txid} out of range"))
        })?;
        let fee_rate = self.u64("fee rate")?;
        let size = self.u32("size")?;
        let fee_delta = self.i64("record fee delta")?;
        let ancestor_count = self.u32("ancestor count")?;
        let descendant_count = self.u32("descendant count")?;
        let parent_count = self.u32("parent count")?;

        let mut parents = Vec::with_capacity(self.capacity_hint(u64::from(parent_count), 32));
        for _ in 0..parent_count {
            parents.push(self.hash("parent txid")?);
        }

        Ok(TransactionRecord {
            payload,
            meta: EntryMetadata {
                txid,
                entry_time,
                fee_rate,
                size,
                fee_delta,
                ancestor_count,
                descendant_count,
                parents,
            },
        })
    }
}

/// Lowercase hex rendering used in checksum errors
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{GzipCompressor, NoCompression};
    use crate::extract::dependency_order;
    use chrono::{TimeZone, Utc};
    use rand::{Rng, SeedableRng};

    fn sample_snapshot() -> Snapshot {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let mut records = Vec::new();
        for i in 0..6i64 {
            let payload: Vec<u8> = (0..rng.gen_range(60..400)).map(|_| rng.gen()).collect();
            let parents = if i > 2 {
                vec![records.last().map(TransactionRecord::txid).unwrap()]
            } else {
                vec![]
            };
            let meta = EntryMetadata::new(
                Hash256::of_payload(&payload),
                base + chrono::Duration::seconds(i),
                1_000 + i as u64,
                payload.len() as u32,
            )
            .with_parents(parents)
            .with_fee_delta(if i == 1 { -250 } else { 0 });
            records.push(TransactionRecord::new(payload, meta));
        }

        let mut snapshot = Snapshot::new(
            PoolState {
                tip: Hash256([0xab; 32]),
                height: 201,
            },
            base,
        );
        snapshot.records = dependency_order(records);
        snapshot.fee_deltas.insert(Hash256([0x11; 32]), 5_000);
        snapshot
    }

    #[test]
    fn test_roundtrip() {
        let snapshot = sample_snapshot();
        let encoded = encode(&snapshot, &NoCompression::new()).unwrap();
        assert_eq!(decode(&encoded).unwrap(), snapshot);
    }

    #[test]
    fn test_roundtrip_gzip() {
        let snapshot = sample_snapshot();
        let encoded = encode(&snapshot, &GzipCompressor::new()).unwrap();
        assert_eq!(decode_header(&encoded).unwrap().compression, GzipCompressor::ID);
        assert_eq!(decode(&encoded).unwrap(), snapshot);
    }

    #[test]
    fn test_empty_snapshot_roundtrip() {
        let snapshot = Snapshot::new(PoolState::default(), Utc.timestamp_opt(0, 0).unwrap());
        let encoded = encode(&snapshot, &NoCompression::new()).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN + 32 + 8 + 8 + 8 + 8 + TRAILER_LEN);
        assert_eq!(decode(&encoded).unwrap(), snapshot);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let snapshot = sample_snapshot();
        let compressor = NoCompression::new();
        assert_eq!(
            encode(&snapshot, &compressor).unwrap(),
            encode(&snapshot, &compressor).unwrap()
        );
    }

    #[test]
    fn test_sub_second_times_are_rejected() {
        let compressor = NoCompression::new();

        let mut snapshot = sample_snapshot();
        snapshot.captured_at += chrono::Duration::milliseconds(250);
        assert!(matches!(
            encode(&snapshot, &compressor),
            Err(FormatError::Malformed(msg)) if msg.contains("capture time")
        ));

        let mut snapshot = sample_snapshot();
        snapshot.records[3].meta.entry_time += chrono::Duration::nanoseconds(1);
        assert!(matches!(
            encode(&snapshot, &compressor),
            Err(FormatError::Malformed(msg)) if msg.contains("arrival time")
        ));
    }

    #[test]
    fn test_version_is_first_field() {
        let encoded = encode(&sample_snapshot(), &NoCompression::new()).unwrap();
        assert_eq!(u16::from_le_bytes([encoded[0], encoded[1]]), FORMAT_VERSION);
        assert_eq!(&encoded[2..6], &MAGIC);
    }

    #[test]
    fn test_rejects_future_version() {
        let mut encoded = encode(&sample_snapshot(), &NoCompression::new())
            .unwrap()
            .to_vec();
        encoded[0..2].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());

        assert_eq!(
            decode(&encoded),
            Err(FormatError::UnsupportedVersion {
                found: FORMAT_VERSION + 1,
                supported: FORMAT_VERSION
            })
        );
    }

    #[test]
    fn test_rejects_foreign_file() {
        let result = decode(b"{\"not\": \"a mempool file\"} padding padding padding padding");
        assert_eq!(result, Err(FormatError::BadMagic));
    }

    #[test]
    fn test_truncated_file() {
        let encoded = encode(&sample_snapshot(), &NoCompression::new()).unwrap();

        for cut in [3, HEADER_LEN + 10, encoded.len() / 2, encoded.len() - 1] {
            let result = decode(&encoded[..cut]);
            assert!(
                matches!(result, Err(FormatError::Truncated(_))),
                "cut at {cut}: {result:?}"
            );
        }
    }

    #[test]
    fn test_flipped_body_byte_fails_checksum() {
        let mut encoded = encode(&sample_snapshot(), &NoCompression::new())
            .unwrap()
            .to_vec();
        encoded[HEADER_LEN + 40] ^= 0xff;

        assert!(matches!(
            decode(&encoded),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_compression_id() {
        let snapshot = sample_snapshot();
        let mut encoded = encode(&snapshot, &NoCompression::new()).unwrap().to_vec();
        encoded[6] = 42;
        // Re-seal so the checksum is not what fails
        let trailer_start = encoded.len() - TRAILER_LEN;
        let digest = Sha256::digest(&encoded[..trailer_start]);
        encoded[trailer_start + 8..].copy_from_slice(&digest);

        assert_eq!(decode(&encoded), Err(FormatError::UnknownCompression(42)));
    }

    #[test]
    fn test_checksum_valid_but_short_body_is_truncated() {
        // A body that claims one record but ends right after the count
        let mut body = BytesMut::new();
        body.put_slice(&[0u8; 32]);
        body.put_u64_le(1);
        body.put_i64_le(0);
        body.put_u64_le(1);

        let mut image = BytesMut::new();
        image.put_u16_le(FORMAT_VERSION);
        image.put_slice(&MAGIC);
        image.put_u8(NoCompression::ID);
        image.put_u8(0);
        image.put_slice(&body);
        let digest = Sha256::digest(&image[..]);
        image.put_u64_le(body.len() as u64);
        image.put_slice(&digest);

        assert_eq!(
            decode(&image),
            Err(FormatError::Truncated("record txid".to_string()))
        );
    }
}
