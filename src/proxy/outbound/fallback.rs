/// 解析中继地址 `host[:port]`
///
/// - `[v6]:port` / `[v6]`
/// - 只含一个冒号时，冒号后是纯数字才当作端口
/// - 其余情况（如裸 IPv6）整体作为主机，端口取目的地端口
///
/// 主机名统一转小写，返回的 IPv6 不带方括号。
pub fn parse_relay_address(addr: &str, default_port: u16) -> (String, u16) {
    let addr = addr.trim();

    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(close) = rest.rfind(']') {
            let host = &rest[..close];
            let port = rest[close + 1..]
                .strip_prefix(':')
                .and_then(parse_port)
                .unwrap_or(default_port);
            return (host.to_ascii_lowercase(), port);
        }
    }

    if let Some(colon) = addr.rfind(':') {
        if colon > 0 && addr.find(':') == Some(colon) {
            if let Some(port) = parse_port(&addr[colon + 1..]) {
                return (addr[..colon].to_ascii_lowercase(), port);
            }
        }
    }

    (addr.to_ascii_lowercase(), default_port)
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
