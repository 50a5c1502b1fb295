#![no_main]

use libfuzzer_sys::fuzz_target;
use memload::image::{parse_for, Architecture, Bitness, Target};

const TARGETS: [Target; 4] = [
    Target::new(Architecture::X86_64, Bitness::Bits64),
    Target::new(Architecture::Aarch64, Bitness::Bits64),
    Target::new(Architecture::X86, Bitness::Bits32),
    Target::new(Architecture::Arm, Bitness::Bits32),
];

fuzz_target!(|data: &[u8]| {
    for target in TARGETS {
        let _ = parse_for(data, target);
    }
});
