//! 帧范围表达式的解析与分块

use std::collections::HashSet;

use renderfarm_core::{ManagerError, ManagerResult};

/// 单个作业允许展开的最大帧数
pub const MAX_FRAME_COUNT: usize = 100_000;

/// 解析 "1-10,15,20-25" 形式的帧范围，保持书写顺序并去掉重复帧
///
/// 展开后的帧数（含重复）超过 [`MAX_FRAME_COUNT`] 时返回 `InvalidJobSettings`。
pub fn parse_frame_range(frames: &str) -> ManagerResult<Vec<i64>> {
    let mut result: Vec<i64> = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();
    let mut expanded: u128 = 0;

    for part in frames.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match split_range(part) {
            Some((start, end)) => (parse_frame(start, frames)?, parse_frame(end, frames)?),
            None => {
                let frame = parse_frame(part, frames)?;
                (frame, frame)
            }
        };

        if end < start {
            return Err(ManagerError::InvalidJobSettings(format!(
                "帧范围 {part} 的结束帧小于起始帧"
            )));
        }

        expanded += (i128::from(end) - i128::from(start) + 1) as u128;
        if expanded > MAX_FRAME_COUNT as u128 {
            return Err(ManagerError::InvalidJobSettings(format!(
                "帧范围 {frames:?} 超过了最多 {MAX_FRAME_COUNT} 帧的限制"
            )));
        }

        for frame in start..=end {
            if seen.insert(frame) {
                result.push(frame);
            }
        }
    }

    if result.is_empty() {
        return Err(ManagerError::InvalidJobSettings(format!(
            "帧范围为空: {frames:?}"
        )));
    }
    Ok(result)
}

// 跳过开头的负号，使 "-5--1" 这样的范围也能解析
fn split_range(part: &str) -> Option<(&str, &str)> {
    let search_from = usize::from(part.starts_with('-'));
    part[search_from..]
        .find('-')
        .map(|idx| (&part[..search_from + idx], &part[search_from + idx + 1..]))
}

fn parse_frame(text: &str, whole: &str) -> ManagerResult<i64> {
    text.trim().parse::<i64>().map_err(|_| {
        ManagerError::InvalidJobSettings(format!("无法解析帧范围 {whole:?} 中的 {text:?}"))
    })
}

/// 把帧列表压缩为紧凑的范围表达式，例如 [1,2,3,5] -> "1-3,5"
pub fn compress_frames(frames: &[i64]) -> String {
    let mut parts = Vec::new();
    let mut iter = frames.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }

    parts.join(",")
}

/// 把帧范围按 `chunk_size` 切分，每块返回一个紧凑的范围表达式
pub fn chunk_frames(frames: &str, chunk_size: usize) -> ManagerResult<Vec<String>> {
    if chunk_size == 0 {
        return Err(ManagerError::InvalidJobSettings(
            "chunk_size必须大于0".to_string(),
        ));
    }
    let frames = parse_frame_range(frames)?;
    Ok(frames.chunks(chunk_size).map(compress_frames).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_range() {
        assert_eq!(parse_frame_range("1-3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_frame_range("5, 1-2,2").unwrap(), vec![5, 1, 2]);
        assert_eq!(parse_frame_range("-2--1").unwrap(), vec![-2, -1]);
        assert!(parse_frame_range("").is_err());
        assert!(parse_frame_range("10-1").is_err());
        assert!(parse_frame_range("a-b").is_err());
    }

    #[test]
    fn test_compress_frames() {
        assert_eq!(compress_frames(&[1, 2, 3, 5, 7, 8]), "1-3,5,7-8");
        assert_eq!(compress_frames(&[4]), "4");
    }

    #[test]
    fn test_chunk_frames() {
        assert_eq!(
            chunk_frames("1-30", 10).unwrap(),
            vec!["1-10", "11-20", "21-30"]
        );
        assert_eq!(chunk_frames("1-5", 2).unwrap(), vec!["1-2", "3-4", "5"]);
        assert_eq!(chunk_frames("1,3,5-6", 3).unwrap(), vec!["1,3,5", "6"]);
        assert!(chunk_frames("1-5", 0).is_err());
    }

    #[test]
    fn test_frame_count_limit() {
        let max = MAX_FRAME_COUNT as i64;
        assert_eq!(parse_frame_range(&format!("1-{max}")).unwrap().len(), MAX_FRAME_COUNT);

        let err = parse_frame_range(&format!("1-{}", max + 1)).unwrap_err();
        assert!(matches!(err, ManagerError::InvalidJobSettings(_)));
        assert!(parse_frame_range("1-9999999999").is_err());
        assert!(parse_frame_range(&format!("{}-{}", i64::MIN, i64::MAX)).is_err());

        // 重复的范围也计入限制，避免反复展开同一段
        let repeated = vec![format!("1-{}", max / 2 + 1); 2].join(",");
        assert!(parse_frame_range(&repeated).is_err());
    }
}
