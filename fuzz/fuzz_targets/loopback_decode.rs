#![no_main]

use codec_conformance::backend::loopback::LoopbackCodec;
use codec_conformance::decoder::decode_to_memory;
use codec_conformance::extractor::IvfExtractor;
use codec_conformance::extractor::SampleSource;
use codec_conformance::extractor::SeekMode;
use codec_conformance::media_format::media_type_for_ivf_fourcc;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some(media_type) = data
        .get(8..12)
        .and_then(|fourcc| fourcc.try_into().ok())
        .and_then(media_type_for_ivf_fourcc)
    else {
        return;
    };
    let Ok(extractor) = IvfExtractor::new(data) else {
        return;
    };
    // Keep the rendered images small.
    let area = extractor
        .track_format(0)
        .ok()
        .and_then(|format| Some(format.width()? as i64 * format.height()? as i64));
    if !matches!(area, Some(1..=1_000_000)) {
        return;
    }

    let _ = decode_to_memory(
        LoopbackCodec::new("loopback.fuzz.decoder", Default::default()),
        extractor,
        media_type,
        "fuzz.ivf",
        0,
        SeekMode::ClosestSync,
        usize::MAX,
    );
});
