use std::env;
use teletext_io::{open, Format, PacketSource, Source};

fn main() {
    pretty_env_logger::init();
    let mut args = env::args().skip(1);
    let format = match args.next().as_deref() {
        Some("t42") => Format::T42,
        Some("vbi") => Format::Vbi,
        Some("vbi-double") => Format::VbiDouble,
        Some("mxf") => Format::Mxf,
        _ => panic!("usage: dump <t42|vbi|vbi-double|mxf> <file>"),
    };
    let path = args.next().expect("No file argument");

    let source = Source::from_path(path).expect("unable to open!");
    let mut stream = open(format, source).expect("unable to bind format!");
    while let Some(packet) = stream.next_packet().expect("Parse Error!") {
        if packet.lines.is_empty() {
            continue;
        }
        println!("{:?}", packet);
    }
}
