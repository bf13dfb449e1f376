#![no_main]

use h264_frontend::backend::dummy::Backend;
use h264_frontend::decoder::reorder::PresentPolicy;
use h264_frontend::decoder::StatelessDecoder;
use h264_frontend::stream::ExtractStream;
use h264_frontend::utils::simple_playback_loop;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let stream = match (ExtractStream::Raw {
        data,
        options: Default::default(),
    })
    .extract()
    {
        Ok(stream) => stream,
        Err(_) => return,
    };

    let num_frames = stream.frames.len();
    let mut decoder = match StatelessDecoder::new(
        stream,
        Backend::new(Default::default(), 0),
        PresentPolicy::default(),
    ) {
        Ok(decoder) => decoder,
        Err(_) => return,
    };

    let _ = simple_playback_loop(&mut decoder, 1.0 / 60.0, num_frames * 4, &mut |_| ());
});
