//! The unit of storage: one [`Index`] bound to one [`Bucket`].
//!
//! The bucket stores `(Header, payload)` records, the index maps ids to
//! record offsets, so every read is two positional reads plus the
//! payload. Because each header repeats its own id and offset, the
//! bucket carries enough redundancy to rebuild a lost index
//! ([`Volume::rebuild_index`]).
//!
//! A write flows as: claim an id with [`Index::next_id`], reserve a
//! region of `HEADER_SIZE + payload` bytes with [`Bucket::allocate`],
//! then [`Volume::write_file`] with the resulting link. Readers that
//! race an in-flight write for the same id may observe a transient id
//! mismatch at the bucket until the writer finishes.

use std::time::{SystemTime, UNIX_EPOCH};

use log::info;

use crate::backend::Backend;
use crate::bucket::Bucket;
use crate::bufpool;
use crate::error::{Result, Site};
use crate::header::Header;
use crate::index::{Index, Link};
use crate::Error;

/// One index paired with one bucket.
#[derive(Debug)]
pub struct Volume<IB: Backend, BB: Backend> {
    pub index: Index<IB>,
    pub bucket: Bucket<BB>,
}

impl<IB: Backend, BB: Backend> Volume<IB, BB> {
    pub fn new(index: Index<IB>, bucket: Bucket<BB>) -> Self {
        Self { index, bucket }
    }

    /// Writes `data` under `link`, stamping the index entry and the
    /// bucket record, and returns the stored header.
    ///
    /// `data` is byte-for-byte intact on return. Does not sync either
    /// backend; durability is an explicit barrier on the components.
    pub fn write_file(&self, link: Link, data: &mut [u8]) -> Result<Header> {
        let length = i32::try_from(data.len())
            .map_err(|_| Error::Io("object larger than 2 GiB".to_string()))?;
        let header = Header {
            id: link.id,
            offset: link.offset,
            length,
            timestamp: now_unix(),
        };
        let mut buf = bufpool::acquire_index_buffer();
        self.index.write(link, &mut buf)?;
        self.bucket.write(&header, data)?;
        Ok(header)
    }

    /// Looks up `id` and invokes `callback` with the stored header and
    /// payload bytes. The bytes are only valid for the duration of the
    /// callback; its result is returned verbatim.
    ///
    /// The link's id is cross-checked at the index and the header's id
    /// at the bucket, so a wrong index for a bucket or a corrupt slot
    /// surfaces as [`Error::IdMismatch`] instead of garbage data.
    pub fn read_file<F>(&self, id: i64, callback: F) -> Result<()>
    where
        F: FnOnce(&Header, &[u8]) -> Result<()>,
    {
        let mut buf = bufpool::acquire_data_buffer();
        let link = self.index.read(id, &mut buf)?;
        if link.id != id {
            return Err(Error::id_mismatch(link.id, id, Site::Index));
        }
        let header = self.bucket.read_header(link, &mut buf)?;
        self.bucket.read_data(&header, &mut buf)?;
        callback(&header, &buf[..header.length as usize])
    }

    /// Rewrites the index from the bucket's records and returns how
    /// many were recovered.
    ///
    /// Scans `[0, bucket.size)` sequentially; every header names its
    /// own id and offset, which is all a link needs. A header whose
    /// self-offset disagrees with the scan position marks a corrupt
    /// region and aborts the rebuild. Restores `last_id` on success.
    pub fn rebuild_index(&self) -> Result<i64> {
        let mut data_buf = bufpool::acquire_data_buffer();
        let mut index_buf = bufpool::acquire_index_buffer();
        let size = self.bucket.size();
        let mut offset = 0;
        let mut count = 0;
        let mut last_id = 0;
        while offset < size {
            let header = self.bucket.header_at(offset, &mut data_buf)?;
            if header.offset != offset || header.length < 0 {
                return Err(Error::Io(format!("corrupt bucket record at offset {offset}")));
            }
            self.index.write(header.link(), &mut index_buf)?;
            if header.id > last_id {
                last_id = header.id;
            }
            offset = header.data_offset() + header.length64();
            count += 1;
        }
        self.index.set_last_id(last_id);
        info!("rebuilt index from bucket: {count} records");
        Ok(count)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use crate::header::HEADER_SIZE;

    fn temp_volume() -> (
        Volume<FileBackend, FileBackend>,
        tempfile::NamedTempFile,
        tempfile::NamedTempFile,
    ) {
        let index_file = tempfile::NamedTempFile::new().expect("index temp file");
        let bucket_file = tempfile::NamedTempFile::new().expect("bucket temp file");
        let index = Index::new(FileBackend::open(index_file.path()).unwrap()).unwrap();
        let bucket = Bucket::new(FileBackend::open(bucket_file.path()).unwrap()).unwrap();
        (Volume::new(index, bucket), index_file, bucket_file)
    }

    #[test]
    fn test_write_then_read() {
        let (volume, _i, _b) = temp_volume();
        let link = Link { id: 0, offset: 0 };
        let mut data = *b"Data";

        let written = volume.write_file(link, &mut data).expect("write file");
        assert_eq!(&data, b"Data", "caller buffer must be intact");
        assert_eq!(written.id, 0);
        assert_eq!(written.length, 4);

        let mut calls = 0;
        volume
            .read_file(0, |header, bytes| {
                calls += 1;
                assert_eq!(*header, written);
                assert_eq!(bytes, b"Data");
                Ok(())
            })
            .expect("read file");
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_read_catches_mismatch_at_index() {
        let (volume, _i, _b) = temp_volume();
        // Zero-filled slots decode as id 0, so make slot 2 readable.
        volume.index.preallocate(4).expect("preallocate");

        let mut data = *b"Data";
        let link = Link { id: 0, offset: 0 };
        let mut buf = Vec::new();
        volume.index.write(link, &mut buf).expect("write link");
        let header = Header {
            id: 2,
            offset: 0,
            length: 4,
            timestamp: now_unix(),
        };
        volume.bucket.write(&header, &mut data).expect("write record");

        let err = volume
            .read_file(2, |_, _| panic!("callback must not be called"))
            .unwrap_err();
        assert_eq!(err, Error::id_mismatch(0, 2, Site::Index));
    }

    #[test]
    fn test_read_catches_mismatch_at_bucket() {
        let (volume, _i, _b) = temp_volume();

        let mut data = *b"Data";
        let link = Link { id: 0, offset: 0 };
        let mut buf = Vec::new();
        volume.index.write(link, &mut buf).expect("write link");
        let header = Header {
            id: 2,
            offset: 0,
            length: 4,
            timestamp: now_unix(),
        };
        volume.bucket.write(&header, &mut data).expect("write record");

        let err = volume
            .read_file(0, |_, _| panic!("callback must not be called"))
            .unwrap_err();
        assert_eq!(err, Error::id_mismatch(2, 0, Site::Bucket));
    }

    #[test]
    fn test_callback_error_is_returned_verbatim() {
        let (volume, _i, _b) = temp_volume();
        let mut data = *b"Data";
        volume
            .write_file(Link { id: 0, offset: 0 }, &mut data)
            .expect("write file");

        let err = volume
            .read_file(0, |_, _| Err(Error::Io("rejected by caller".to_string())))
            .unwrap_err();
        assert_eq!(err, Error::Io("rejected by caller".to_string()));
    }

    #[test]
    fn test_full_write_flow() {
        let (volume, _i, _b) = temp_volume();
        let payloads: Vec<Vec<u8>> = (0u8..16)
            .map(|i| vec![i; 16 + usize::from(i) * 7])
            .collect();

        let mut links = Vec::new();
        for payload in &payloads {
            let id = volume.index.next_id().expect("next id");
            let offset = volume
                .bucket
                .allocate(HEADER_SIZE as i64 + payload.len() as i64)
                .expect("allocate");
            let mut data = payload.clone();
            let link = Link { id, offset };
            volume.write_file(link, &mut data).expect("write file");
            links.push(link);
        }

        for (link, payload) in links.iter().zip(&payloads) {
            volume
                .read_file(link.id, |header, bytes| {
                    assert_eq!(header.id, link.id);
                    assert_eq!(header.offset, link.offset);
                    assert_eq!(bytes, &payload[..]);
                    Ok(())
                })
                .expect("read file");
        }
    }

    #[test]
    fn test_rebuild_index() {
        let (volume, _i, _b) = temp_volume();
        let payloads: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i + 1; 24 + usize::from(i)]).collect();

        let mut links = Vec::new();
        for payload in &payloads {
            let id = volume.index.next_id().expect("next id");
            let offset = volume
                .bucket
                .allocate(HEADER_SIZE as i64 + payload.len() as i64)
                .expect("allocate");
            let mut data = payload.clone();
            let link = Link { id, offset };
            volume.write_file(link, &mut data).expect("write file");
            links.push(link);
        }

        // Wipe the index, then recover it from the bucket's records.
        volume.index.preallocate(0).expect("wipe");
        volume.index.preallocate(64).expect("preallocate");
        let recovered = volume.rebuild_index().expect("rebuild");
        assert_eq!(recovered, links.len() as i64);
        assert_eq!(volume.index.last_id(), links.last().unwrap().id);

        for (link, payload) in links.iter().zip(&payloads) {
            volume
                .read_file(link.id, |_, bytes| {
                    assert_eq!(bytes, &payload[..]);
                    Ok(())
                })
                .expect("read after rebuild");
        }
    }
}
