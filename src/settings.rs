#[derive(Clone, Debug)]
pub struct Settings {
    pub max_line_chars: usize, // character budget for one stringized line
    pub max_depth: usize, // how many levels of nested structs/arrays/pointees to show inside one line
    pub max_list_nodes: usize, // list() stops following the next-pointer after this many nodes
    pub max_array_children: usize,
    pub preread_limit: usize, // at most this many bytes of one value are read for formatting
    pub max_string_bytes: usize, // for null-terminated strings behind char pointers
    pub max_threads: usize,
    pub profile_threshold_secs: f64, // log block/row production that takes longer than this
}

impl Default for Settings {
    fn default() -> Self { Settings {
        max_line_chars: 512,
        max_depth: 4,
        max_list_nodes: 10000,
        max_array_children: 1 << 24,
        preread_limit: 100000,
        max_string_bytes: 1 << 12,
        max_threads: 8,
        profile_threshold_secs: 0.1,
    } }
}
