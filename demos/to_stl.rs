use std::env;
use std::fs::File;
use teletext_io::{
    convert, open, CancelToken, Context, ConvertOptions, Format, OutputFormat, Source,
};

fn main() {
    pretty_env_logger::init();
    let mut args = env::args().skip(1);
    let input = args.next().expect("No input argument");
    let output = args.next().expect("No output argument");

    let source = Source::from_path(input).expect("unable to open!");
    let mut stream = open(Format::Mxf, source).expect("unable to bind format!");

    let mut options = ConvertOptions::default();
    options.output = OutputFormat::Stl;
    options.stl.title = "Converted captions".to_string();

    let mut file = File::create(output).expect("unable to create!");
    let summary = convert(
        &mut stream,
        &options,
        &Context::new(),
        &mut file,
        &CancelToken::new(),
    )
    .expect("Convert Error!");
    println!(
        "{} packets in, {} subtitles out",
        summary.packets, summary.lines
    );
}
