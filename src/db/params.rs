//! Binding intent values as PostgreSQL parameters.
//!
//! The server infers each placeholder's type from the column it is compared
//! against, so a JSON integer may have to travel as `int4`, `numeric` or
//! `float8`. `Value` converts itself to whatever type the statement expects.
use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::intent::Value;

type BoxError = Box<dyn Error + Sync + Send>;

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ if is_text(ty) => b.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            Value::Int(i) => int_to_sql(*i, ty, out).unwrap_or_else(|| Err(mismatch(self, ty))),
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                Type::NUMERIC => Decimal::from_f64_retain(*f)
                    .ok_or_else(|| mismatch(self, ty))?
                    .normalize()
                    .to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 if f.fract() == 0.0 => {
                    int_to_sql(*f as i64, ty, out).unwrap_or_else(|| Err(mismatch(self, ty)))
                }
                _ if is_text(ty) => f.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            Value::Text(s) => text_to_sql(s, ty, out).unwrap_or_else(|| Err(mismatch(self, ty))),
            Value::List(_) => Err("list values are only valid as IN operands".into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_text(ty: &Type) -> bool {
    <String as ToSql>::accepts(ty)
}

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!(
        "cannot bind {} value {:?} to parameter of type {}",
        value.type_name(),
        value,
        ty.name()
    )
    .into()
}

fn int_to_sql(i: i64, ty: &Type, out: &mut BytesMut) -> Option<Result<IsNull, BoxError>> {
    let result = match *ty {
        Type::INT2 => i16::try_from(i)
            .map_err(BoxError::from)
            .and_then(|v| v.to_sql(ty, out)),
        Type::INT4 => i32::try_from(i)
            .map_err(BoxError::from)
            .and_then(|v| v.to_sql(ty, out)),
        Type::INT8 => i.to_sql(ty, out),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(i).to_sql(ty, out),
        _ if is_text(ty) => i.to_string().to_sql(ty, out),
        _ => return None,
    };
    Some(result)
}

fn text_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> Option<Result<IsNull, BoxError>> {
    let result = match *ty {
        _ if is_text(ty) => s.to_sql(ty, out),
        Type::DATE => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(BoxError::from)
            .and_then(|d| d.to_sql(ty, out)),
        Type::TIMESTAMP => parse_naive_datetime(s)
            .ok_or_else(|| BoxError::from(format!("invalid timestamp {:?}", s)))
            .and_then(|d| d.to_sql(ty, out)),
        Type::TIMESTAMPTZ => parse_timestamptz(s)
            .ok_or_else(|| BoxError::from(format!("invalid timestamp {:?}", s)))
            .and_then(|d| d.to_sql(ty, out)),
        Type::JSON | Type::JSONB => serde_json::Value::String(s.to_string()).to_sql(ty, out),
        Type::NUMERIC => s
            .parse::<Decimal>()
            .map_err(BoxError::from)
            .and_then(|d| d.to_sql(ty, out)),
        Type::INT2 | Type::INT4 | Type::INT8 => {
            let i = s.trim().parse::<i64>().ok()?;
            return int_to_sql(i, ty, out);
        }
        Type::FLOAT4 | Type::FLOAT8 => {
            let f = s.trim().parse::<f64>().ok()?;
            return Some(Value::Float(f).to_sql(ty, out));
        }
        _ => return None,
    };
    Some(result)
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_timestamptz(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_naive_datetime(s).map(|naive| naive.and_utc()))
}
