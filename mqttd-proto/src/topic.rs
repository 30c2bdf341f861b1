use std::fmt::{self, Display, Formatter, Write};
use std::str::FromStr;

use crate::errors::{Error, Result};

#[inline]
fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

/// One `/`-separated segment of a topic filter.
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub enum Level {
    /// A literal segment.
    Normal(String),
    /// A `$`-prefixed segment, e.g. `$SYS`; never matched by a leading wildcard.
    Metadata(String),
    /// A zero-length segment, as in `finance//closings`.
    Blank,
    /// Single level wildcard `+`
    SingleWildcard,
    /// Multi-level wildcard `#`
    MultiWildcard,
}

impl Level {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }
}

impl FromStr for Level {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                // `+` and `#` must stand alone in their segment [MQTT-4.7.1-3].
                if s.contains(|c| c == '+' || c == '#') {
                    Err(Error::Protocol(format!("invalid topic level `{}`", s)))
                } else if is_metadata(s) {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

/// A parsed, validated topic filter.
///
/// An expression contained in a Subscription, to indicate an interest in
/// one or more topics. A Topic Filter can include wildcard characters.
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct Filter(Vec<Level>);

impl Filter {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    /// Whether any segment is a wildcard.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    #[inline]
    fn is_valid(&self) -> bool {
        // All Topic Names and Topic Filters MUST be at least one character
        // long [MQTT-4.7.3-1]; a lone blank level is the empty filter.
        if self.0.is_empty() || self.0 == [Level::Blank] {
            return false;
        }

        self.0.iter().enumerate().all(|(pos, level)| match *level {
            // The multi-level wildcard character MUST be the last character [MQTT-4.7.1-2].
            Level::MultiWildcard => pos == self.0.len() - 1,
            Level::Metadata(_) => pos == 0,
            _ => true,
        })
    }
}

impl FromStr for Filter {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Protocol("empty topic filter".to_owned()));
        }

        s.split('/')
            .map(Level::from_str)
            .collect::<Result<Vec<_>>>()
            .map(Filter)
            .and_then(|filter| {
                if filter.is_valid() {
                    Ok(filter)
                } else {
                    Err(Error::Protocol(format!("invalid topic filter `{}`", s)))
                }
            })
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut first = true;

        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }

            level.fmt(f)?;
        }

        Ok(())
    }
}

/// Whether a concrete topic name is a valid PUBLISH topic.
///
/// The Topic Name in a PUBLISH Packet MUST NOT contain wildcard
/// characters [MQTT-3.3.2-2].
pub fn valid_topic_name(s: &str) -> bool {
    !s.is_empty() && !s.contains(|c| c == '+' || c == '#') && !s.contains('\u{0}')
}

/// Matching a topic name against a filter.
pub trait MatchTopic {
    fn match_topic(&self, filter: &Filter) -> bool;
}

impl<T: AsRef<str>> MatchTopic for T {
    fn match_topic(&self, filter: &Filter) -> bool {
        let mut segments = self.as_ref().split('/').enumerate();
        let mut levels = filter.levels().iter();

        loop {
            match (levels.next(), segments.next()) {
                (Some(&Level::MultiWildcard), Some((pos, segment))) => {
                    // The Server MUST NOT match Topic Filters starting with a
                    // wildcard character with Topic Names beginning with a `$`
                    // character [MQTT-4.7.2-1].
                    return pos != 0 || !is_metadata(segment);
                }
                // `#` also matches the parent level itself, i.e. zero segments.
                (Some(&Level::MultiWildcard), None) => return true,
                (Some(&Level::SingleWildcard), Some((pos, segment))) => {
                    if pos == 0 && is_metadata(segment) {
                        return false;
                    }
                }
                (Some(level), Some((_, segment))) => {
                    // a blank level only matches a zero-length segment
                    if level.value().map_or(!segment.is_empty(), |s| s != segment) {
                        return false;
                    }
                }
                (None, None) => return true,
                (Some(_), None) | (None, Some(_)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> Filter {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("sport".parse::<Level>().unwrap(), Level::Normal("sport".to_owned()));
        assert_eq!("$SYS".parse::<Level>().unwrap(), Level::Metadata("$SYS".to_owned()));
        assert_eq!("+".parse::<Level>().unwrap(), Level::SingleWildcard);
        assert_eq!("#".parse::<Level>().unwrap(), Level::MultiWildcard);
        assert_eq!("".parse::<Level>().unwrap(), Level::Blank);

        assert!("sport+".parse::<Level>().is_err());
        assert!("sp#ort".parse::<Level>().is_err());
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            filter("sport/tennis/player1").levels(),
            &[
                Level::Normal("sport".to_owned()),
                Level::Normal("tennis".to_owned()),
                Level::Normal("player1".to_owned()),
            ]
        );

        assert_eq!(
            filter("/finance").levels(),
            &[Level::Blank, Level::Normal("finance".to_owned())]
        );

        assert_eq!(filter("$SYS").levels(), &[Level::Metadata("$SYS".to_owned())]);

        assert!("".parse::<Filter>().is_err());
        assert!("sport/$SYS".parse::<Filter>().is_err());
        assert!("sport/tennis#".parse::<Filter>().is_err());
        assert!("sport/tennis/#/ranking".parse::<Filter>().is_err());
        assert!("sport+".parse::<Filter>().is_err());
    }

    #[test]
    fn test_wildcard_filters() {
        assert_eq!(filter("#").levels(), &[Level::MultiWildcard]);
        assert_eq!(
            filter("+/tennis/#").levels(),
            &[
                Level::SingleWildcard,
                Level::Normal("tennis".to_owned()),
                Level::MultiWildcard,
            ]
        );

        assert!(filter("sport/#").is_wildcard());
        assert!(filter("+").is_wildcard());
        assert!(!filter("sport/tennis").is_wildcard());
    }

    #[test]
    fn test_valid_topic_name() {
        assert!(valid_topic_name("sport/tennis"));
        assert!(valid_topic_name("/"));
        assert!(!valid_topic_name(""));
        assert!(!valid_topic_name("sport/+"));
        assert!(!valid_topic_name("sport/#"));
        assert!(!valid_topic_name("sp\u{0}ort"));
    }

    #[test]
    fn test_match_topic() {
        let t = filter("sport/tennis/player1/#");

        assert!("sport/tennis/player1".match_topic(&t));
        assert!("sport/tennis/player1/ranking".match_topic(&t));
        assert!("sport/tennis/player1/score/wimbledon".match_topic(&t));

        assert!("sport".match_topic(&filter("sport/#")));

        let t = filter("sport/tennis/+");

        assert!("sport/tennis/player1".match_topic(&t));
        assert!("sport/tennis/player2".match_topic(&t));
        assert!(!"sport/tennis/player1/ranking".match_topic(&t));

        let t = filter("sport/+");

        assert!(!"sport".match_topic(&t));
        assert!("sport/".match_topic(&t));

        assert!("/finance".match_topic(&filter("+/+")));
        assert!("/finance".match_topic(&filter("/+")));
        assert!(!"/finance".match_topic(&filter("+")));
    }

    #[test]
    fn test_metadata_topics_hidden_from_wildcards() {
        assert!(!"$SYS".match_topic(&filter("#")));
        assert!(!"$SYS/monitor/Clients".match_topic(&filter("+/monitor/Clients")));
        assert!("$SYS/".match_topic(&filter("$SYS/#")));
        assert!("$SYS/monitor/Clients".match_topic(&filter("$SYS/monitor/+")));

        // `$` is only special in the first segment
        assert!("sport/$x".match_topic(&filter("sport/#")));
        assert!("sport/$x".match_topic(&filter("sport/+")));
    }

    #[test]
    fn test_exact_match_is_reflexive() {
        for name in &["sport", "sport/tennis", "/finance", "a/b/c"] {
            assert!(name.match_topic(&filter(name)), "{} should match itself", name);
        }
    }
}
