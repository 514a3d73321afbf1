#![no_main]

use codec_conformance::extractor::IvfExtractor;
use codec_conformance::extractor::SampleSource;
use codec_conformance::extractor::SeekMode;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(mut extractor) = IvfExtractor::new(data) else {
        return;
    };
    if extractor.select_track(0).is_err() {
        return;
    }

    let mut buf = vec![];
    while let Some(size) = extractor.sample_size() {
        buf.resize(size, 0);
        let _ = extractor.read_sample_data(&mut buf);
        if !extractor.advance() {
            break;
        }
    }
    extractor.seek_to(i64::MAX, SeekMode::ClosestSync);
    extractor.seek_to(0, SeekMode::NextSync);
});
