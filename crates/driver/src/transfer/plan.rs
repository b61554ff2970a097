//! Chunk sizing for transfers larger than one URB

use crate::config::MAX_READ_WRITE;
use protocol::PipeType;

/// Most packets a single isochronous URB may describe
pub const MAX_ISO_PACKETS: usize = 255;

/// One URB's share of a transfer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub len: usize,
}

/// Largest transfer handed to the bus for one endpoint. A non-zero
/// `requested` size within the pipe's own maximum wins; a pipe reporting
/// zero falls back to the platform ceiling.
pub fn max_transfer_size(requested: u32, pipe_max: u32) -> usize {
    let pipe_max = if pipe_max == 0 { MAX_READ_WRITE } else { pipe_max };
    if requested != 0 && requested <= pipe_max {
        requested as usize
    } else {
        pipe_max as usize
    }
}

/// Bytes per chunk. Isochronous chunks stay within 255 packets and are
/// rounded down to whole packets (never below one packet).
pub fn chunk_limit(pipe_type: PipeType, max_transfer: usize, packet_size: usize) -> usize {
    match pipe_type {
        PipeType::Isochronous if packet_size > 0 => {
            let bytes = max_transfer.min(packet_size * MAX_ISO_PACKETS);
            (bytes / packet_size).max(1) * packet_size
        }
        _ => max_transfer.max(1),
    }
}

/// Number of chunks `plan_chunks` would produce, without building them
pub fn chunk_count(total: usize, limit: usize) -> usize {
    total.div_ceil(limit.max(1))
}

/// Splits `total` bytes into consecutive chunks of at most `limit` bytes
pub fn plan_chunks(total: usize, limit: usize) -> Vec<Chunk> {
    let limit = limit.max(1);
    (0..chunk_count(total, limit))
        .map(|i| {
            let offset = i * limit;
            Chunk {
                offset,
                len: limit.min(total - offset),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forty_thousand_byte_read() {
        let chunks = plan_chunks(40000, 16384);
        let lens: Vec<usize> = chunks.iter().map(|c| c.len).collect();
        assert_eq!(lens, vec![16384, 16384, 7232]);
        assert_eq!(chunks[2].offset, 32768);
    }

    #[test]
    fn test_max_transfer_size_selection() {
        assert_eq!(max_transfer_size(0, 16384), 16384);
        assert_eq!(max_transfer_size(4096, 16384), 4096);
        assert_eq!(max_transfer_size(65536, 16384), 16384);
        assert_eq!(max_transfer_size(0, 0), MAX_READ_WRITE as usize);
    }

    #[test]
    fn test_iso_chunk_limit() {
        // 192 * 255 = 48960 bytes, below a 64 KiB maximum
        assert_eq!(chunk_limit(PipeType::Isochronous, 65536, 192), 48960);
        // 1000 / 192 rounds down to 5 packets
        assert_eq!(chunk_limit(PipeType::Isochronous, 1000, 192), 960);
        assert_eq!(chunk_limit(PipeType::Isochronous, 100, 192), 192);
        assert_eq!(chunk_limit(PipeType::Bulk, 16384, 512), 16384);
    }

    #[test]
    fn test_chunk_count_without_planning() {
        assert_eq!(chunk_count(40000, 16384), 3);
        assert_eq!(chunk_count(16 * 1024 * 1024, 1), 16 * 1024 * 1024);
        assert_eq!(chunk_count(0, 4096), 0);
        assert_eq!(chunk_count(10, 0), 10);
    }

    #[test]
    fn test_empty_plan() {
        assert!(plan_chunks(0, 512).is_empty());
    }
}
