//! 消费者组配置
//!
//! 构造时一次性校验所有枚举值，未知的分配策略直接返回启动期致命错误。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, UranusError};

/// 分区分配策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignor {
    RoundRobin,
    Sticky,
    Range,
}

impl Assignor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Assignor::RoundRobin => "roundrobin",
            Assignor::Sticky => "sticky",
            Assignor::Range => "range",
        }
    }

    /// librdkafka `partition.assignment.strategy` 取值
    pub fn rdkafka_strategy(&self) -> &'static str {
        match self {
            Assignor::RoundRobin => "roundrobin",
            Assignor::Sticky => "cooperative-sticky",
            Assignor::Range => "range",
        }
    }
}

impl fmt::Display for Assignor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Assignor {
    type Err = UranusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roundrobin" | "round-robin" => Ok(Assignor::RoundRobin),
            "sticky" => Ok(Assignor::Sticky),
            "range" => Ok(Assignor::Range),
            _ => Err(UranusError::UnrecognizedAssignor(s.to_owned())),
        }
    }
}

/// 没有已提交 offset 时的起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialOffset {
    Oldest,
    #[default]
    Newest,
}

impl InitialOffset {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitialOffset::Oldest => "oldest",
            InitialOffset::Newest => "newest",
        }
    }

    /// librdkafka `auto.offset.reset` 取值
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        }
    }
}

impl FromStr for InitialOffset {
    type Err = UranusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest" | "earliest" => Ok(InitialOffset::Oldest),
            "newest" | "latest" => Ok(InitialOffset::Newest),
            _ => Err(UranusError::invalid_config(format!(
                "unrecognized initial offset: {s}"
            ))),
        }
    }
}

/// 消费者组配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupConfig {
    brokers: Vec<String>,
    topics: Vec<String>,
    group_id: String,
    assignor: Assignor,
    initial_offset: InitialOffset,
    session_timeout: Duration,
}

impl ConsumerGroupConfig {
    /// 校验并构建配置
    ///
    /// `topics` 按首次出现的顺序去重。
    pub fn new<B, T>(
        brokers: B,
        topics: T,
        group_id: impl Into<String>,
        assignor: &str,
        initial_offset: &str,
    ) -> Result<Self>
    where
        B: IntoIterator,
        B::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let assignor: Assignor = assignor.parse()?;
        let initial_offset: InitialOffset = initial_offset.parse()?;

        let brokers: Vec<String> = brokers
            .into_iter()
            .map(Into::into)
            .filter(|b: &String| !b.trim().is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(UranusError::invalid_config(
                "consumer requires at least one broker",
            ));
        }

        let mut unique: Vec<String> = Vec::new();
        for topic in topics.into_iter().map(Into::into) {
            if !topic.trim().is_empty() && !unique.contains(&topic) {
                unique.push(topic);
            }
        }
        if unique.is_empty() {
            return Err(UranusError::invalid_config(
                "consumer requires at least one topic",
            ));
        }

        let group_id = group_id.into();
        if group_id.trim().is_empty() {
            return Err(UranusError::invalid_config("consumer group id is empty"));
        }

        Ok(Self {
            brokers,
            topics: unique,
            group_id,
            assignor,
            initial_offset,
            session_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn assignor(&self) -> Assignor {
        self.assignor
    }

    pub fn initial_offset(&self) -> InitialOffset {
        self.initial_offset
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn subscribes_to(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignors() {
        assert_eq!("roundrobin".parse::<Assignor>().unwrap(), Assignor::RoundRobin);
        assert_eq!("Sticky".parse::<Assignor>().unwrap(), Assignor::Sticky);
        assert_eq!("range".parse::<Assignor>().unwrap(), Assignor::Range);
        assert_eq!(Assignor::Sticky.rdkafka_strategy(), "cooperative-sticky");
    }

    #[test]
    fn rejects_unknown_assignor() {
        let err = ConsumerGroupConfig::new(["localhost:9092"], ["orders"], "g", "fifo", "oldest")
            .unwrap_err();
        assert!(matches!(err, UranusError::UnrecognizedAssignor(ref a) if a == "fifo"));
    }

    #[test]
    fn deduplicates_topics() {
        let config = ConsumerGroupConfig::new(
            ["localhost:9092"],
            ["orders", "payments", "orders"],
            "g",
            "range",
            "newest",
        )
        .unwrap();
        assert_eq!(config.topics(), ["orders", "payments"]);
        assert_eq!(config.initial_offset().auto_offset_reset(), "latest");
    }

    #[test]
    fn requires_brokers_and_topics() {
        let no_brokers: [&str; 0] = [];
        assert!(ConsumerGroupConfig::new(no_brokers, ["t"], "g", "range", "oldest").is_err());
        let no_topics: [&str; 0] = [];
        assert!(ConsumerGroupConfig::new(["b:9092"], no_topics, "g", "range", "oldest").is_err());
    }
}
