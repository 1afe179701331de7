use std::{cmp::Ordering, collections::BTreeMap, str::FromStr};

use serde::{de::Deserializer, Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use strum::{AsRefStr, EnumString};

use crate::{
    error::{Error, Result},
    Labels,
};

const LABEL_PREFIX: char = '&';
const AND_OPERATOR: &str = "$and";

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
pub enum Operator {
    #[strum(serialize = "$eq")]
    Eq,
    #[strum(serialize = "$ne")]
    Ne,
    #[strum(serialize = "$gt")]
    Gt,
    #[strum(serialize = "$gte")]
    Gte,
    #[strum(serialize = "$lt")]
    Lt,
    #[strum(serialize = "$lte")]
    Lte,
    #[strum(serialize = "$in")]
    In,
    /// Serialized as an empty operator object: `{"&label": {}}`.
    #[strum(serialize = "$exists")]
    Exists,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub label: String,
    pub operator: Operator,
    pub value: Value,
}

impl Expression {
    fn to_json(&self) -> Value {
        let mut operand = Map::new();
        if self.operator != Operator::Exists {
            operand.insert(self.operator.as_ref().to_string(), self.value.clone());
        }
        let mut object = Map::new();
        object.insert(format!("{LABEL_PREFIX}{}", self.label), Value::Object(operand));
        Value::Object(object)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        let Some(actual) = labels.get(&self.label) else {
            return false;
        };
        match self.operator {
            Operator::Exists => true,
            Operator::Eq => compare(actual, &self.value) == Some(Ordering::Equal),
            Operator::Ne => compare(actual, &self.value) != Some(Ordering::Equal),
            Operator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => match &self.value {
                Value::Array(candidates) => candidates
                    .iter()
                    .any(|candidate| compare(actual, candidate) == Some(Ordering::Equal)),
                _ => false,
            },
        }
    }
}

/// Label values travel as strings. They compare numerically against numbers,
/// as booleans against booleans and lexically against strings.
fn compare(actual: &str, expected: &Value) -> Option<Ordering> {
    match expected {
        Value::Number(number) => {
            let expected = number.as_f64()?;
            let actual = actual.trim().parse::<f64>().ok()?;
            actual.partial_cmp(&expected)
        }
        Value::String(expected) => Some(actual.cmp(expected.as_str())),
        Value::Bool(expected) => {
            let actual = actual.parse::<bool>().ok()?;
            Some(actual.cmp(expected))
        }
        _ => None,
    }
}

/// Label predicate of a query: every expression must hold.
///
/// On the wire this is the `when` object, e.g.
/// `{"&score": {"$gt": 10}, "&kind": {"$eq": "a"}}`. Two expressions on the
/// same label cannot share one JSON object, so such conditions are sent as
/// `{"$and": [{"&score": {"$gt": 10}}, {"&score": {"$lt": 20}}]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition(pub Vec<Expression>);

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, label: impl Into<String>, operator: Operator, value: Value) -> Self {
        self.0.push(Expression {
            label: label.into(),
            operator,
            value,
        });
        self
    }

    pub fn eq(self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(label, Operator::Eq, value.into())
    }

    pub fn ne(self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(label, Operator::Ne, value.into())
    }

    pub fn gt(self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(label, Operator::Gt, value.into())
    }

    pub fn gte(self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(label, Operator::Gte, value.into())
    }

    pub fn lt(self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(label, Operator::Lt, value.into())
    }

    pub fn lte(self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(label, Operator::Lte, value.into())
    }

    pub fn is_in<V: Into<Value>>(
        self,
        label: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push(label, Operator::In, Value::Array(values))
    }

    pub fn exists(self, label: impl Into<String>) -> Self {
        self.push(label, Operator::Exists, Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }

    pub fn to_json(&self) -> Value {
        let mut per_label: BTreeMap<&str, usize> = BTreeMap::new();
        for expr in &self.0 {
            *per_label.entry(expr.label.as_str()).or_default() += 1;
        }

        if per_label.values().all(|count| *count == 1) {
            let mut object = Map::new();
            for expr in &self.0 {
                if let Value::Object(entry) = expr.to_json() {
                    object.extend(entry);
                }
            }
            return Value::Object(object);
        }

        let mut object = Map::new();
        object.insert(
            AND_OPERATOR.to_string(),
            Value::Array(self.0.iter().map(Expression::to_json).collect()),
        );
        Value::Object(object)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let mut condition = Condition::new();
        condition.collect(value)?;
        Ok(condition)
    }

    fn collect(&mut self, value: &Value) -> Result<()> {
        let Value::Object(object) = value else {
            return Err(Error::invalid_argument(format!(
                "condition must be an object, got {value}"
            )));
        };

        for (key, operand) in object {
            if key == AND_OPERATOR {
                let Value::Array(items) = operand else {
                    return Err(Error::invalid_argument("$and expects an array"));
                };
                for item in items {
                    self.collect(item)?;
                }
                continue;
            }

            let Some(label) = key.strip_prefix(LABEL_PREFIX) else {
                return Err(Error::invalid_argument(format!(
                    "unsupported condition key '{key}'"
                )));
            };
            let Value::Object(operand) = operand else {
                return Err(Error::invalid_argument(format!(
                    "operand of '{key}' must be an object"
                )));
            };

            let mut operand = operand.iter();
            let expr = match (operand.next(), operand.next()) {
                (None, _) => Expression {
                    label: label.to_string(),
                    operator: Operator::Exists,
                    value: Value::Null,
                },
                (Some((operator, value)), None) => Expression {
                    label: label.to_string(),
                    operator: Operator::from_str(operator).map_err(|_| {
                        Error::invalid_argument(format!("unknown operator '{operator}'"))
                    })?,
                    value: value.clone(),
                },
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "operand of '{key}' must hold a single operator"
                    )))
                }
            };
            self.0.push(expr);
        }
        Ok(())
    }
}

impl Serialize for Condition {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Condition, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Condition::from_json(&value).map_err(serde::de::Error::custom)
    }
}
