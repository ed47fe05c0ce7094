//! 版本号与版本范围
//!
//! 模块包版本采用 `major[.minor[.micro[.qualifier]]]` 形式，内部映射到
//! [`semver::Version`]。限定符（qualifier）作为构建元数据保存，因此
//! `1.0.0.beta` 排在 `1.0.0` 之后。
//!
//! 版本范围使用区间语法：
//!
//! - `[1.0,2.0)` - 包含下界，不包含上界
//! - `(1.0,2.0]` - 不包含下界，包含上界
//! - `1.0` - 至少 1.0（没有上界）
//!
//! # 示例
//!
//! ```rust
//! use chips_runtime::bundle::version::{parse_version, VersionRange};
//!
//! let range = VersionRange::parse("[1.0,2.0)").unwrap();
//! assert!(range.contains(&parse_version("1.5").unwrap()));
//! assert!(!range.contains(&parse_version("2.0").unwrap()));
//! ```

use std::fmt;
use std::str::FromStr;

use semver::{BuildMetadata, Version};

use crate::utils::{CoreError, Result};

/// 解析模块包版本号
///
/// 缺省的次版本号与修订号补 0，第四段作为限定符。
pub fn parse_version(value: &str) -> Result<Version> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Version::new(0, 0, 0));
    }

    let mut parts = trimmed.splitn(4, '.');
    let mut numbers = [0u64; 3];
    for slot in numbers.iter_mut() {
        match parts.next() {
            Some(part) => {
                *slot = part.parse::<u64>().map_err(|e| CoreError::InvalidVersion {
                    value: value.to_string(),
                    reason: format!("'{}' 不是数字: {}", part, e),
                })?;
            }
            None => break,
        }
    }

    let mut version = Version::new(numbers[0], numbers[1], numbers[2]);
    if let Some(qualifier) = parts.next() {
        if qualifier.is_empty()
            || !qualifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::InvalidVersion {
                value: value.to_string(),
                reason: format!("限定符 '{}' 含有非法字符", qualifier),
            });
        }
        version.build = BuildMetadata::new(&qualifier.replace('_', "-"))?;
    }

    Ok(version)
}

/// 以模块包的习惯格式输出版本号
pub fn format_version(version: &Version) -> String {
    if version.build.is_empty() {
        format!("{}.{}.{}", version.major, version.minor, version.patch)
    } else {
        format!(
            "{}.{}.{}.{}",
            version.major,
            version.minor,
            version.patch,
            version.build.as_str()
        )
    }
}

/// 版本范围
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    floor: Version,
    floor_inclusive: bool,
    ceiling: Option<Version>,
    ceiling_inclusive: bool,
}

impl VersionRange {
    /// 匹配任意版本的范围（`0.0.0` 起，无上界）
    pub fn any() -> Self {
        Self::at_least(Version::new(0, 0, 0))
    }

    /// 至少为指定版本
    pub fn at_least(floor: Version) -> Self {
        Self {
            floor,
            floor_inclusive: true,
            ceiling: None,
            ceiling_inclusive: false,
        }
    }

    /// 指定上下界创建区间
    pub fn between(
        floor: Version,
        floor_inclusive: bool,
        ceiling: Version,
        ceiling_inclusive: bool,
    ) -> Result<Self> {
        let empty = match floor.cmp(&ceiling) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !(floor_inclusive && ceiling_inclusive),
            std::cmp::Ordering::Less => false,
        };
        if empty {
            return Err(CoreError::InvalidVersion {
                value: format!("{}..{}", format_version(&floor), format_version(&ceiling)),
                reason: "版本范围为空".to_string(),
            });
        }
        Ok(Self {
            floor,
            floor_inclusive,
            ceiling: Some(ceiling),
            ceiling_inclusive,
        })
    }

    /// 从字符串解析版本范围，空字符串表示任意版本
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(Self::any());
        }

        let first = trimmed.chars().next();
        if !matches!(first, Some('[') | Some('(')) {
            return Ok(Self::at_least(parse_version(trimmed)?));
        }

        let invalid = |reason: &str| CoreError::InvalidVersion {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let floor_inclusive = first == Some('[');
        let ceiling_inclusive = match trimmed.chars().last() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(invalid("区间缺少结束符 ']' 或 ')'")),
        };

        let inner = &trimmed[1..trimmed.len() - 1];
        let (low, high) = inner
            .split_once(',')
            .ok_or_else(|| invalid("区间必须包含上下界，以逗号分隔"))?;
        if high.contains(',') {
            return Err(invalid("区间只能包含两个版本"));
        }

        Self::between(
            parse_version(low)?,
            floor_inclusive,
            parse_version(high)?,
            ceiling_inclusive,
        )
    }

    /// 检查版本是否落在范围内
    pub fn contains(&self, version: &Version) -> bool {
        let above_floor = if self.floor_inclusive {
            version >= &self.floor
        } else {
            version > &self.floor
        };
        if !above_floor {
            return false;
        }
        match &self.ceiling {
            None => true,
            Some(ceiling) if self.ceiling_inclusive => version <= ceiling,
            Some(ceiling) => version < ceiling,
        }
    }

    /// 检查本范围是否完全落在另一个范围之内（相等或更窄）
    pub fn is_subset_of(&self, other: &VersionRange) -> bool {
        let floor_ok = match other.floor.cmp(&self.floor) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => other.floor_inclusive || !self.floor_inclusive,
            std::cmp::Ordering::Greater => false,
        };
        if !floor_ok {
            return false;
        }

        match (&self.ceiling, &other.ceiling) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(mine), Some(theirs)) => match mine.cmp(theirs) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => other.ceiling_inclusive || !self.ceiling_inclusive,
                std::cmp::Ordering::Greater => false,
            },
        }
    }

    /// 范围下界
    pub fn floor(&self) -> &Version {
        &self.floor
    }

    /// 范围上界（无上界时为 `None`）
    pub fn ceiling(&self) -> Option<&Version> {
        self.ceiling.as_ref()
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl FromStr for VersionRange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ceiling {
            None if self.floor_inclusive => write!(f, "{}", format_version(&self.floor)),
            None => write!(f, "({},∞)", format_version(&self.floor)),
            Some(ceiling) => write!(
                f,
                "{}{},{}{}",
                if self.floor_inclusive { '[' } else { '(' },
                format_version(&self.floor),
                format_version(ceiling),
                if self.ceiling_inclusive { ']' } else { ')' }
            ),
        }
    }
}
