/// File name written by the first publisher process.
pub const PUB_OUTPUT_FILE: &str = "pub_0.csv";

/// Extension of every artifact the benchmark writes next to its executable.
pub const ARTIFACT_EXTENSION: &str = "csv";

/// Highest durability kind accepted by perftest (`PERSISTENT`).
pub const MAX_DURABILITY: u8 = 3;

/// Number of underscore-separated tokens in a QoS name.
pub const QOS_NAME_TOKENS: usize = 8;

/// Output file name for subscriber `index`.
#[must_use]
pub fn sub_output_file(index: u32) -> String {
    format!("sub_{index}.{ARTIFACT_EXTENSION}")
}
