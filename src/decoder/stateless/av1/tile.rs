// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Carving of a tile group payload into the byte ranges of its tiles.

use anyhow::anyhow;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::codec::av1::parser::TileInfo;

/// Bytes of a tile, as a range of the tile group payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileBuffer {
    pub start: usize,
    pub size: usize,
    /// Where the tile's coded bytes end in the payload. Differs from
    /// `start + size` for large scale tiles copying the data of another tile.
    pub raw_data_end: usize,
}

impl TileBuffer {
    pub fn data<'a>(&self, payload: &'a [u8]) -> anyhow::Result<&'a [u8]> {
        payload
            .get(self.start..self.start + self.size)
            .ok_or(anyhow!("Tile buffer {}+{} outside of the payload", self.start, self.size))
    }
}

/// The tile buffers of a frame, indexed by tile row and column. Tiles that
/// were not carved have no buffer.
#[derive(Clone, Debug, Default)]
pub struct TileBuffers {
    cols: usize,
    buffers: Vec<Option<TileBuffer>>,
}

impl TileBuffers {
    fn new(tile_info: &TileInfo) -> Self {
        let cols = tile_info.tile_cols as usize;
        Self { cols, buffers: vec![None; cols * tile_info.tile_rows as usize] }
    }

    pub fn get(&self, row: u32, col: u32) -> Option<&TileBuffer> {
        if col as usize >= self.cols {
            return None;
        }

        self.buffers.get(row as usize * self.cols + col as usize).and_then(Option::as_ref)
    }

    fn set(&mut self, row: u32, col: u32, buffer: TileBuffer) -> anyhow::Result<()> {
        let idx = row as usize * self.cols + col as usize;
        let slot = self
            .buffers
            .get_mut(idx)
            .filter(|_| (col as usize) < self.cols)
            .ok_or(anyhow!("Tile {}x{} outside of the tile grid", row, col))?;
        *slot = Some(buffer);
        Ok(())
    }
}

/// The largest tile seen in the frame so far. Its adapted entropy context
/// becomes the frame context when backward adaptation is on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LargestTile {
    pub id: u32,
    pub size: usize,
}

/// Reads a `num_bytes` little-endian size field at `pos`.
fn read_size(data: &[u8], pos: usize, num_bytes: usize) -> Option<usize> {
    if !(1..=8).contains(&num_bytes) {
        return None;
    }

    data.get(pos..pos.checked_add(num_bytes)?)
        .map(|field| LittleEndian::read_uint(field, num_bytes) as usize)
}

/// Carves tiles `start..=end` out of `data`. Every tile but the last is
/// preceded by its size minus one, the last tile takes the remaining bytes.
pub fn get_tile_buffers(
    data: &[u8],
    tile_info: &TileInfo,
    start: u32,
    end: u32,
    largest: &mut LargestTile,
) -> anyhow::Result<TileBuffers> {
    let mut buffers = TileBuffers::new(tile_info);
    let tile_cols = tile_info.tile_cols.max(1);
    let tile_size_bytes = tile_info.tile_size_bytes as usize;
    let mut pos = 0;

    if start == 0 {
        *largest = Default::default();
    }

    for tile in start..=end {
        if pos >= data.len() {
            return Err(anyhow!("Data ended before all tiles were read."));
        }

        let size = if tile == end {
            data.len() - pos
        } else {
            let size = read_size(data, pos, tile_size_bytes)
                .ok_or(anyhow!("Truncated packet or corrupt tile length"))?
                + 1;
            pos += tile_size_bytes;
            if size > data.len() - pos {
                return Err(anyhow!("Truncated packet or corrupt tile size"));
            }
            size
        };

        buffers.set(
            tile / tile_cols,
            tile % tile_cols,
            TileBuffer { start: pos, size, raw_data_end: pos + size },
        )?;

        if size > largest.size {
            *largest = LargestTile { id: tile, size };
        }

        pos += size;
    }

    Ok(buffers)
}

/// Carves the tile at (`row`, `col`) of a large scale tile payload, starting
/// at `*pos` and ending at most at `col_end`.
fn get_ls_tile_buffer(
    data: &[u8],
    col_end: usize,
    pos: &mut usize,
    buffers: &mut TileBuffers,
    tile_size_bytes: usize,
    row: u32,
    col: u32,
    copy_mode: bool,
) -> anyhow::Result<()> {
    let limit = data.get(..col_end).ok_or(anyhow!("Truncated packet or corrupt tile size"))?;
    let mut size = read_size(limit, *pos, tile_size_bytes)
        .ok_or(anyhow!("Truncated packet or corrupt tile length"))?;

    // In copy mode, a size with its top bit set reuses the data of a tile
    // above in the same column. The rest of the top byte is the row offset.
    let mut copied = None;
    if copy_mode && (size >> (tile_size_bytes * 8 - 1)) == 1 {
        let offset = ((size >> ((tile_size_bytes - 1) * 8)) & 0x7f) as u32;
        if offset == 0 || offset > row {
            return Err(anyhow!("Invalid tile copy offset {} at tile row {}", offset, row));
        }

        copied = Some(
            *buffers
                .get(row - offset, col)
                .ok_or(anyhow!("Tile copy source {}x{} is missing", row - offset, col))?,
        );
        size = 0;
    } else {
        size += 1;
    }

    *pos += tile_size_bytes;
    if size > limit.len() - *pos {
        return Err(anyhow!("Truncated packet or corrupt tile size"));
    }

    let buffer = match copied {
        Some(source) => TileBuffer { start: source.start, size: source.size, raw_data_end: *pos },
        None => TileBuffer { start: *pos, size, raw_data_end: *pos + size },
    };
    buffers.set(row, col, buffer)?;
    *pos += size;

    Ok(())
}

/// Carves the tiles needed to decode the tile at (`dec_tile_row`,
/// `dec_tile_col`) of a large scale tile payload, plus the whole last column
/// so the end of the payload is known. `None` selects every row or column.
pub fn get_ls_tile_buffers(
    data: &[u8],
    tile_info: &TileInfo,
    dec_tile_row: Option<u32>,
    dec_tile_col: Option<u32>,
) -> anyhow::Result<TileBuffers> {
    let mut buffers = TileBuffers::new(tile_info);
    let tile_rows = tile_info.tile_rows;
    let tile_cols = tile_info.tile_cols;

    if tile_rows * tile_cols == 1 {
        buffers.set(0, 0, TileBuffer { start: 0, size: data.len(), raw_data_end: data.len() })?;
        return Ok(buffers);
    }

    let tile_size_bytes = tile_info.tile_size_bytes as usize;
    let tile_col_size_bytes = tile_info.tile_col_size_bytes as usize;
    let copy_mode = (tile_info.tile_width_mi.max(tile_info.tile_height_mi) << 2) <= 256;

    // Every column but the last is preceded by its size.
    let mut col_ends = Vec::with_capacity(tile_cols as usize);
    let mut pos = 0usize;
    for col in 0..tile_cols {
        let col_end = if col == tile_cols - 1 {
            data.len()
        } else {
            let size = read_size(data, pos, tile_col_size_bytes)
                .ok_or(anyhow!("Truncated packet or corrupt tile column size"))?;
            pos += tile_col_size_bytes;
            pos.checked_add(size)
                .filter(|&end| end <= data.len())
                .ok_or(anyhow!("Truncated packet or corrupt tile column size"))?
        };

        col_ends.push(col_end);
        pos = col_end;
    }

    let (cols_start, cols_end) = match dec_tile_col {
        Some(col) => (col, col + 1),
        None => (0, tile_cols),
    };
    let rows_end = dec_tile_row.map_or(tile_rows, |row| row + 1);

    let column_start = |col: u32| -> usize {
        let start = if col > 0 { col_ends[col as usize - 1] } else { 0 };
        if col == tile_cols - 1 {
            start
        } else {
            start + tile_col_size_bytes
        }
    };

    for col in cols_start..cols_end.min(tile_cols) {
        let is_last = col == tile_cols - 1;
        let mut pos = column_start(col);

        for row in 0..(if is_last { tile_rows } else { rows_end }) {
            get_ls_tile_buffer(
                data,
                col_ends[col as usize],
                &mut pos,
                &mut buffers,
                tile_size_bytes,
                row,
                col,
                copy_mode,
            )?;
        }
    }

    if cols_end < tile_cols {
        let col = tile_cols - 1;
        let mut pos = column_start(col);

        for row in 0..tile_rows {
            get_ls_tile_buffer(
                data,
                col_ends[col as usize],
                &mut pos,
                &mut buffers,
                tile_size_bytes,
                row,
                col,
                copy_mode,
            )?;
        }
    }

    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile_info(rows: u32, cols: u32, tile_size_bytes: u32) -> TileInfo {
        TileInfo { tile_rows: rows, tile_cols: cols, tile_size_bytes, ..Default::default() }
    }

    #[test]
    fn explicit_sizes() {
        // 2 byte sizes: tile 0 has 3 bytes, tile 1 has 1 byte, tile 2 takes the rest.
        let data = [0x02, 0x00, 0xa, 0xb, 0xc, 0x00, 0x00, 0xd, 0xe, 0xf, 0x10, 0x11];
        let ti = tile_info(1, 3, 2);
        let mut largest = LargestTile::default();

        let buffers = get_tile_buffers(&data, &ti, 0, 2, &mut largest).unwrap();
        let b0 = buffers.get(0, 0).unwrap();
        let b1 = buffers.get(0, 1).unwrap();
        let b2 = buffers.get(0, 2).unwrap();
        assert_eq!(b0.data(&data).unwrap(), &[0xa, 0xb, 0xc]);
        assert_eq!(b1.data(&data).unwrap(), &[0xd]);
        assert_eq!(b2.data(&data).unwrap(), &[0xe, 0xf, 0x10, 0x11]);
        assert_eq!(largest, LargestTile { id: 2, size: 4 });
    }

    #[test]
    fn tile_group_subset() {
        // Tiles 1 and 2 of a 2x2 grid.
        let data = [0x01, 0xa, 0xb, 0xc];
        let ti = tile_info(2, 2, 1);
        let mut largest = LargestTile { id: 0, size: 10 };

        let buffers = get_tile_buffers(&data, &ti, 1, 2, &mut largest).unwrap();
        assert!(buffers.get(0, 0).is_none());
        assert_eq!(buffers.get(0, 1).unwrap().data(&data).unwrap(), &[0xa, 0xb]);
        assert_eq!(buffers.get(1, 0).unwrap().data(&data).unwrap(), &[0xc]);
        assert!(buffers.get(1, 1).is_none());
        // Sizes are compared against the earlier groups of the frame.
        assert_eq!(largest, LargestTile { id: 0, size: 10 });
    }

    #[test]
    fn ties_keep_the_first_tile() {
        let data = [0x01, 0xa, 0xb, 0xc, 0xd];
        let ti = tile_info(1, 2, 1);
        let mut largest = LargestTile::default();

        get_tile_buffers(&data, &ti, 0, 1, &mut largest).unwrap();
        assert_eq!(largest, LargestTile { id: 0, size: 2 });
    }

    #[test]
    fn corrupt_sizes() {
        let ti = tile_info(1, 2, 2);
        let mut largest = LargestTile::default();

        let err = get_tile_buffers(&[0x05, 0x00, 0xa, 0xb], &ti, 0, 1, &mut largest).unwrap_err();
        assert_eq!(err.to_string(), "Truncated packet or corrupt tile size");

        let err = get_tile_buffers(&[0x05], &ti, 0, 1, &mut largest).unwrap_err();
        assert_eq!(err.to_string(), "Truncated packet or corrupt tile length");

        // The first tile uses every byte, leaving nothing for the second one.
        let err = get_tile_buffers(&[0x01, 0x00, 0xa, 0xb], &ti, 0, 1, &mut largest).unwrap_err();
        assert_eq!(err.to_string(), "Data ended before all tiles were read.");

        let err = get_tile_buffers(&[], &tile_info(1, 1, 4), 0, 0, &mut largest).unwrap_err();
        assert_eq!(err.to_string(), "Data ended before all tiles were read.");
    }

    fn ls_tile_info() -> TileInfo {
        TileInfo {
            tile_rows: 3,
            tile_cols: 2,
            tile_size_bytes: 1,
            tile_col_size_bytes: 1,
            tile_width_mi: 16,
            tile_height_mi: 16,
            ..Default::default()
        }
    }

    /// A 3x2 large scale payload where tile (2, 0) copies tile (0, 0).
    fn ls_payload() -> Vec<u8> {
        vec![
            // Column 0: 6 bytes.
            0x06, //
            0x01, 0xa0, 0xa1, // (0, 0)
            0x00, 0xb0, // (1, 0)
            0x82, // (2, 0): copy from two rows above
            // Column 1, the last one.
            0x00, 0xc0, // (0, 1)
            0x01, 0xd0, 0xd1, // (1, 1)
            0x00, 0xe0, // (2, 1)
        ]
    }

    #[test]
    fn large_scale_copy_mode() {
        let data = ls_payload();
        let buffers = get_ls_tile_buffers(&data, &ls_tile_info(), None, None).unwrap();

        let tile = |row, col| buffers.get(row, col).unwrap().data(&data).unwrap().to_vec();
        assert_eq!(tile(0, 0), vec![0xa0, 0xa1]);
        assert_eq!(tile(1, 0), vec![0xb0]);
        assert_eq!(tile(2, 0), vec![0xa0, 0xa1]);
        assert_eq!(tile(0, 1), vec![0xc0]);
        assert_eq!(tile(1, 1), vec![0xd0, 0xd1]);
        assert_eq!(tile(2, 1), vec![0xe0]);

        // The copied tile still ends where its own header does.
        assert_eq!(buffers.get(2, 0).unwrap().raw_data_end, 7);
        assert_eq!(buffers.get(2, 1).unwrap().raw_data_end, data.len());
    }

    #[test]
    fn large_scale_single_tile_selection() {
        let data = ls_payload();
        let buffers = get_ls_tile_buffers(&data, &ls_tile_info(), Some(1), Some(0)).unwrap();

        // Rows up to the selected one in the selected column, plus the whole
        // last column.
        assert!(buffers.get(0, 0).is_some());
        assert_eq!(buffers.get(1, 0).unwrap().data(&data).unwrap(), &[0xb0]);
        assert!(buffers.get(2, 0).is_none());
        assert_eq!(buffers.get(2, 1).unwrap().raw_data_end, data.len());
    }

    #[test]
    fn large_scale_bad_copy() {
        let mut data = ls_payload();
        // Copy from three rows above row 2.
        data[6] = 0x83;
        let err = get_ls_tile_buffers(&data, &ls_tile_info(), None, None).unwrap_err();
        assert_eq!(err.to_string(), "Invalid tile copy offset 3 at tile row 2");

        // Without copy mode the top bit is part of a (too large) size.
        let data = ls_payload();
        let ti = TileInfo { tile_width_mi: 128, ..ls_tile_info() };
        let err = get_ls_tile_buffers(&data, &ti, None, None).unwrap_err();
        assert_eq!(err.to_string(), "Truncated packet or corrupt tile size");
    }

    #[test]
    fn large_scale_truncated_column() {
        let mut data = ls_payload();
        data[0] = 0x40;
        let err = get_ls_tile_buffers(&data, &ls_tile_info(), None, None).unwrap_err();
        assert_eq!(err.to_string(), "Truncated packet or corrupt tile column size");
    }

    #[test]
    fn large_scale_one_tile() {
        let data = [1u8, 2, 3];
        let ti = TileInfo { tile_rows: 1, tile_cols: 1, ..ls_tile_info() };
        let buffers = get_ls_tile_buffers(&data, &ti, None, None).unwrap();
        assert_eq!(buffers.get(0, 0).unwrap().data(&data).unwrap(), &data);
    }
}
