use super::{unsupported_data_type, CommError};
use digit_layout::{types as ty, DigitLayout};

/// 数据类型在计算核中的类型宏名称。
///
/// 不在表中的类型在建立任何通道之前就被拒绝，避免部分节点进入集合握手。
pub fn type_name(dt: DigitLayout) -> Result<&'static str, CommError> {
    Ok(match dt {
        ty::F16 => "__half",
        ty::BF16 => "__nv_bfloat16",
        ty::F32 => "float",
        ty::F64 => "double",
        ty::I32 => "int",
        ty::U32 => "unsigned int",
        _ => Err(unsupported_data_type(format!("{dt:?} has no kernel type")))?,
    })
}

/// Element width in bytes of a supported type.
pub fn sizeof(dt: DigitLayout) -> Result<usize, CommError> {
    Ok(match dt {
        ty::F16 | ty::BF16 => 2,
        ty::F32 | ty::I32 | ty::U32 => 4,
        ty::F64 => 8,
        _ => Err(unsupported_data_type(format!("{dt:?} has no kernel type")))?,
    })
}

/// Inverse of [`type_name`], used by kernels that receive the type as a macro.
pub fn from_type_name(name: &str) -> Result<DigitLayout, CommError> {
    Ok(match name {
        "__half" => ty::F16,
        "__nv_bfloat16" => ty::BF16,
        "float" => ty::F32,
        "double" => ty::F64,
        "int" => ty::I32,
        "unsigned int" => ty::U32,
        _ => Err(unsupported_data_type(format!("unknown kernel type {name}")))?,
    })
}

#[test]
fn test_type_name() {
    use super::CommErrorKind;

    for dt in [ty::F16, ty::BF16, ty::F32, ty::F64, ty::I32, ty::U32] {
        let name = type_name(dt).unwrap();
        assert_eq!(from_type_name(name).unwrap(), dt);
    }
    assert_eq!(type_name(ty::F16).unwrap(), "__half");
    assert_eq!(sizeof(ty::F16).unwrap(), 2);
    assert_eq!(sizeof(ty::F64).unwrap(), 8);

    let e = type_name(ty::I8).unwrap_err();
    assert_eq!(e.kind, CommErrorKind::UnsupportedDataType);
    assert!(sizeof(ty::U8).is_err());
}
