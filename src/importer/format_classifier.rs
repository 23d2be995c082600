// ==========================================
// 健康数据导入引擎 - 格式识别
// ==========================================
// 规则: 以扩展名为准（.csv / .json / .xml），无副作用
// 内容校验只在格式确定之后进行，不符时按结构错误处理
// ==========================================

use crate::domain::types::SourceFormat;
use crate::importer::error::ImportError;
use std::path::Path;

/// 根据文件名扩展名选择解析路径
pub fn classify(file_name: &str) -> SourceFormat {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "csv" => SourceFormat::Tabular,
        "json" => SourceFormat::Tree,
        "xml" => SourceFormat::Hierarchical,
        _ => SourceFormat::Unsupported,
    }
}

/// 内容首字符校验（格式已由扩展名确定）
///
/// .json 须以 { 或 [ 开头，.xml 须以 < 开头，不符时为结构错误；
/// CSV 没有可靠的首字符特征，不做校验。UTF-16 内容交给解析器判断。
pub fn check_signature(format: SourceFormat, head: &[u8]) -> Result<(), ImportError> {
    if head.starts_with(&[0xFF, 0xFE]) || head.starts_with(&[0xFE, 0xFF]) {
        return Ok(());
    }
    let head = head.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(head);
    let first = head.iter().copied().find(|b| !b.is_ascii_whitespace());

    match (format, first) {
        (_, None) => Ok(()),
        (SourceFormat::Tree, Some(b'{' | b'[')) => Ok(()),
        (SourceFormat::Tree, Some(b)) => Err(ImportError::json_structure(format!(
            "文档应以 {{ 或 [ 开头，实际为 0x{:02X}",
            b
        ))),
        (SourceFormat::Hierarchical, Some(b'<')) => Ok(()),
        (SourceFormat::Hierarchical, Some(b)) => Err(ImportError::xml_structure(format!(
            "文档应以 < 开头，实际为 0x{:02X}",
            b
        ))),
        _ => Ok(()),
    }
}
