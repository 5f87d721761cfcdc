use whodb_core::EngineError;

/// Split a raw command line into arguments, honoring single and double
/// quotes so values with spaces survive (`SET greeting "hello world"`).
pub fn split_command(line: &str) -> Result<Vec<String>, EngineError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return Err(EngineError::invalid_argument("unterminated quote in command"));
    }
    if !current.is_empty() {
        args.push(current);
    }
    if args.is_empty() {
        return Err(EngineError::invalid_argument("empty command"));
    }
    Ok(args)
}

/// Commands the raw-execute surface refuses outright; they change server
/// topology or block the connection.
const DENIED_COMMANDS: &[&str] = &[
    "SUBSCRIBE", "PSUBSCRIBE", "MONITOR", "SHUTDOWN", "DEBUG", "REPLICAOF", "SLAVEOF", "MIGRATE",
];

pub fn is_denied(command: &str) -> bool {
    DENIED_COMMANDS
        .iter()
        .any(|denied| denied.eq_ignore_ascii_case(command))
}

/// Read-only Redis commands; everything else counts as mutating for the
/// MCP confirmation gate.
const READ_COMMANDS: &[&str] = &[
    "GET", "MGET", "STRLEN", "EXISTS", "TYPE", "TTL", "PTTL", "KEYS", "SCAN", "HGET", "HGETALL",
    "HKEYS", "HVALS", "HLEN", "HSCAN", "LRANGE", "LLEN", "LINDEX", "SMEMBERS", "SCARD",
    "SISMEMBER", "SSCAN", "ZRANGE", "ZCARD", "ZSCORE", "ZSCAN", "INFO", "PING", "DBSIZE",
    "MEMORY", "OBJECT", "RANDOMKEY",
];

pub fn is_read_command(command: &str) -> bool {
    READ_COMMANDS
        .iter()
        .any(|read| read.eq_ignore_ascii_case(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_arguments() {
        assert_eq!(
            split_command("SET greeting \"hello world\"").unwrap(),
            vec!["SET", "greeting", "hello world"]
        );
        assert_eq!(
            split_command("GET 'key with spaces'").unwrap(),
            vec!["GET", "key with spaces"]
        );
    }

    #[test]
    fn rejects_unterminated_quotes_and_empty_input() {
        assert!(split_command("SET x \"oops").is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn classifies_commands() {
        assert!(is_read_command("get"));
        assert!(!is_read_command("FLUSHALL"));
        assert!(is_denied("shutdown"));
    }
}
