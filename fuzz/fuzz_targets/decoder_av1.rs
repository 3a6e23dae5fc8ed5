#![no_main]

use cros_av1dec::codec::av1::parser::ObuAction;
use cros_av1dec::codec::av1::parser::ParsedObu;
use cros_av1dec::codec::av1::parser::Parser;
use cros_av1dec::decoder::stateless::av1::tile::get_tile_buffers;
use cros_av1dec::decoder::stateless::av1::tile::LargestTile;
use libfuzzer_sys::fuzz_target;

/// Parses every OBU of `data` and carves the tiles of the tile groups.
fn parse_stream(mut data: &[u8]) -> anyhow::Result<()> {
    let mut parser = Parser::default();
    let mut largest = LargestTile::default();

    while !data.is_empty() {
        let obu = match parser.read_obu(data)? {
            ObuAction::Process(obu) => obu,
            ObuAction::Drop(length) => {
                data = &data[length..];
                continue;
            }
        };
        let length = obu.bytes_used;

        let tile_group = match parser.parse_obu(obu)? {
            ParsedObu::SequenceHeader(_) => {
                parser.choose_operating_point(0)?;
                None
            }
            ParsedObu::TileGroup(tile_group) => Some(tile_group),
            ParsedObu::Frame(frame) => Some(frame.tile_group),
            ParsedObu::TemporalDelimiter | ParsedObu::FrameHeader(_) => None,
        };

        if let (Some(tile_group), Some(hdr)) = (tile_group, &parser.last_frame_header) {
            get_tile_buffers(
                tile_group.tile_data,
                &hdr.tile_info,
                tile_group.tg_start,
                tile_group.tg_end,
                &mut largest,
            )?;
        }

        data = &data[length..];
    }

    Ok(())
}

fuzz_target!(|data: &[u8]| {
    let _ = parse_stream(data);
});
