// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! h264play, a simple player running an H.264 stream through the decode and presentation loop
//! of h264-frontend with the dummy backend. Capable of computing CRC32 checksums of the frames
//! in the order they are displayed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use argh::FromArgs;
use h264_frontend::backend::dummy::Backend;
use h264_frontend::backend::dummy::DummyPicture;
use h264_frontend::backend::dummy::OutputMode;
use h264_frontend::codec::h264::parser::ParseError;
use h264_frontend::decoder::reorder::PresentPolicy;
use h264_frontend::decoder::reorder::ReorderedPicture;
use h264_frontend::decoder::Error as DecoderError;
use h264_frontend::decoder::StatelessBackendError;
use h264_frontend::decoder::StatelessDecoder;
use h264_frontend::stream::mp4::Mp4Demuxer;
use h264_frontend::stream::ExtractError;
use h264_frontend::stream::ExtractOptions;
use h264_frontend::stream::ExtractStream;
use h264_frontend::utils::frame_crc32;
use h264_frontend::utils::simple_playback_loop;
use log::error;
use log::info;

const EXIT_NO_VIDEO: i8 = -1;
const EXIT_NO_DEVICE: i8 = -2;
const EXIT_UNSUPPORTED_PROFILE: i8 = -3;
const EXIT_NO_DECODE_QUEUE: i8 = -4;
const EXIT_DECODER_CREATION: i8 = -5;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum InputFormat {
    Mp4,
    H264,
}

impl FromStr for InputFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mp4" | "MP4" => Ok(InputFormat::Mp4),
            "h264" | "H264" => Ok(InputFormat::H264),
            _ => Err("unrecognized input format. Valid values: mp4, h264"),
        }
    }
}

#[derive(Debug)]
enum CrcComputation {
    Stream,
    Frame,
}

impl FromStr for CrcComputation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(CrcComputation::Stream),
            "frame" => Ok(CrcComputation::Frame),
            _ => Err("unrecognized CRC computation option. Valid values: stream, frame"),
        }
    }
}

/// Simple H.264 player using h264-frontend
#[derive(Debug, FromArgs)]
struct Args {
    /// input file. Default: test.mp4
    #[argh(positional, default = "PathBuf::from(\"test.mp4\")")]
    input: PathBuf,

    /// input format (mp4 or h264). Default: guessed from the file extension
    #[argh(option)]
    input_format: Option<InputFormat>,

    /// frames per second of raw H.264 input. Default: 60
    #[argh(option, default = "60.0")]
    framerate: f32,

    /// where the backend leaves decoded pictures (coincide or dedicated). Default: coincide
    #[argh(option, default = "OutputMode::Coincide")]
    output_mode: OutputMode,

    /// whether to display the CRC32 of the displayed frames, and at which granularity (stream
    /// or frame)
    #[argh(option)]
    compute_crc: Option<CrcComputation>,

    /// number of times to play the stream. Default: 1
    #[argh(option, default = "1")]
    loops: usize,
}

fn guess_format(input: &std::path::Path) -> InputFormat {
    match input.extension().and_then(|e| e.to_str()) {
        Some("h264" | "264" | "avc" | "bin") => InputFormat::H264,
        _ => InputFormat::Mp4,
    }
}

fn extract_error_code(err: &ExtractError) -> i8 {
    match err {
        ExtractError::Parse(ParseError::UnsupportedProfile(_))
        | ExtractError::Parse(ParseError::UnsupportedPocType(_)) => EXIT_UNSUPPORTED_PROFILE,
        _ => EXIT_NO_VIDEO,
    }
}

fn decoder_error_code(err: &DecoderError) -> i8 {
    match err {
        DecoderError::Backend(StatelessBackendError::NoDevice) => EXIT_NO_DEVICE,
        DecoderError::Backend(StatelessBackendError::UnsupportedProfile(_)) => {
            EXIT_UNSUPPORTED_PROFILE
        }
        DecoderError::Backend(StatelessBackendError::NoDecodeQueue) => EXIT_NO_DECODE_QUEUE,
        _ => EXIT_DECODER_CREATION,
    }
}

fn exit(code: i8) -> ExitCode {
    ExitCode::from(code as u8)
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Args = argh::from_env();

    let data = match std::fs::read(&args.input) {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => {
            error!("{} is empty", args.input.display());
            return exit(EXIT_NO_VIDEO);
        }
        Err(e) => {
            error!("failed to read {}: {}", args.input.display(), e);
            return exit(EXIT_NO_VIDEO);
        }
    };

    let input_format = args
        .input_format
        .unwrap_or_else(|| guess_format(&args.input));

    let stream = match input_format {
        InputFormat::Mp4 => {
            let demuxer = match Mp4Demuxer::new(data) {
                Ok(demuxer) => demuxer,
                Err(e) => {
                    error!("no playable video track: {:#}", e);
                    return exit(EXIT_NO_VIDEO);
                }
            };
            ExtractStream::Container(&demuxer).extract()
        }
        InputFormat::H264 => ExtractStream::Raw {
            data: &data,
            options: ExtractOptions {
                framerate: args.framerate,
            },
        }
        .extract(),
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            error!("failed to extract the elementary stream: {}", e);
            return exit(extract_error_code(&e));
        }
    };

    let num_frames = stream.frames.len();
    // Streams without timing are played at 60 fps.
    let elapsed = match stream.duration / num_frames as f64 {
        elapsed if elapsed > 0.0 => elapsed,
        _ => 1.0 / 60.0,
    };
    let crcs: Vec<u32> = (0..num_frames)
        .map(|i| frame_crc32(&stream, i).unwrap_or_default())
        .collect();
    let timestamps: Vec<f64> = stream.frames.iter().map(|f| f.timestamp).collect();

    let backend = Backend::new(args.output_mode, 0);
    let mut decoder = match StatelessDecoder::new(stream, backend, PresentPolicy::default()) {
        Ok(decoder) => decoder,
        Err(e) => {
            error!("failed to create the decoder: {}", e);
            return exit(decoder_error_code(&e));
        }
    };

    let mut stream_crc = crc32fast::Hasher::new();

    for pass in 0..args.loops {
        let mut on_display = |picture: &ReorderedPicture<DummyPicture>| {
            let crc = crcs[picture.frame_index];

            match args.compute_crc {
                Some(CrcComputation::Frame) => println!("{:08x}", crc),
                Some(CrcComputation::Stream) => stream_crc.update(&crc.to_le_bytes()),
                None => (),
            }

            info!(
                "loop {}: frame {} (display {}) at {:.3}s",
                pass, picture.frame_index, picture.display_order, timestamps[picture.frame_index]
            );
        };

        if let Err(e) = simple_playback_loop(&mut decoder, elapsed, num_frames * 4, &mut on_display)
        {
            error!("playback failed: {:#}", e);
            return exit(EXIT_NO_VIDEO);
        }
    }

    if let Some(CrcComputation::Stream) = args.compute_crc {
        println!("{:08x}", stream_crc.finalize());
    }

    info!(
        "{} decodes submitted, {} display pictures allocated",
        decoder.backend().records().len(),
        decoder.backend().num_allocated_pictures()
    );

    ExitCode::SUCCESS
}
