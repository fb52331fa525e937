//! The advisory request record: any host can nudge the current owner to
//! yield. If the owner is dead the record changes nothing; the requester
//! proceeds with the usual ballot.

use sector_io::{read_sectors, write_sector};
use tracing::debug;

use ondisk::{RequestRecord, REQUEST_SECTOR};

use crate::errors::Result;
use crate::token::Token;

pub async fn request_read(token: &Token) -> Result<RequestRecord> {
    let buf = read_sectors(
        &token.disks[0],
        token.sector_size,
        REQUEST_SECTOR,
        1,
        token.io_timeout(),
    )
    .await?;
    Ok(RequestRecord::decode_from(&buf)?)
}

pub async fn request_write(token: &Token, rr: &RequestRecord) -> Result<()> {
    let mut sector = vec![0u8; token.sector_size as usize];
    rr.encode_into(&mut sector)?;
    for disk in &token.disks {
        write_sector(
            disk,
            token.sector_size,
            REQUEST_SECTOR,
            &sector,
            token.io_timeout(),
        )
        .await?;
    }
    debug!(
        resource = %token.resource_name,
        lver = rr.lver,
        force_mode = rr.force_mode,
        "request record written"
    );
    Ok(())
}
