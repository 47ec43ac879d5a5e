use proptest::prelude::*;
use svckit::filter::{CompareOp, Expr, Prop};
use svckit::{Filter, PropertyMap, PropertyValue};

fn compare_op() -> impl Strategy<Value = CompareOp> {
    prop_oneof![
        Just(CompareOp::Eq),
        Just(CompareOp::Le),
        Just(CompareOp::Ge),
        Just(CompareOp::Approx),
    ]
}

fn leaf() -> impl Strategy<Value = Expr> {
    (compare_op(), "[a-z][a-z0-9.]{0,6}", r"[a-zA-Z0-9()*\\.:-]{1,8}")
        .prop_map(|(op, attr, value)| Expr::Compare { op, attr, value })
}

fn expr() -> impl Strategy<Value = Expr> {
    leaf().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Expr::And),
            prop::collection::vec(inner.clone(), 1..4).prop_map(Expr::Or),
            inner.prop_map(|e| Expr::Not(Box::new(e))),
        ]
    })
}

proptest! {
    #[test]
    fn canonical_text_parses_back(e in expr()) {
        let text = e.to_string();
        let parsed = Filter::parse(&text).unwrap();
        prop_assert_eq!(parsed.expr(), &e);
        prop_assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn literal_values_match_themselves(value in r"[a-zA-Z0-9()*\\]{1,10}") {
        let filter = Prop::new("k").eq(&value).build();
        let props = PropertyMap::new().with("k", value.as_str());
        prop_assert!(filter.matches(&props));
        prop_assert!(Filter::parse(&filter.to_string()).unwrap().matches(&props));
    }

    #[test]
    fn presence_tracks_non_null_values(key in "[a-h]{1,6}", present in any::<bool>(), number in any::<i64>()) {
        let filter = Filter::parse(&format!("({key}=*)")).unwrap();
        let mut props = PropertyMap::new().with("other", 1);
        if present {
            props.insert(key.to_uppercase(), number);
        } else {
            props.insert(key.as_str(), PropertyValue::Null);
        }
        prop_assert_eq!(filter.matches(&props), present);
    }
}
