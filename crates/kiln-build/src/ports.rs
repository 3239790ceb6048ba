/// Sort `port/proto` strings by port number, then protocol.
///
/// A missing protocol counts as `tcp`. Entries whose port does not parse
/// keep their text and sort after every numeric port.
pub fn sort_exposed_ports<I, S>(ports: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut keyed: Vec<((u32, String), String)> = ports
        .into_iter()
        .map(Into::into)
        .map(|p| (sort_key(&p), p))
        .collect();
    keyed.sort();
    keyed.into_iter().map(|(_, p)| p).collect()
}

fn sort_key(port: &str) -> (u32, String) {
    let (number, proto) = port.split_once('/').unwrap_or((port, "tcp"));
    let number = number
        .trim()
        .parse::<u16>()
        .map_or(u32::MAX, u32::from);
    (number, proto.to_ascii_lowercase())
}
