//! Topic routing keys and binding patterns.
//!
//! A routing key is `lower(aggregate_type) + "." + dot.case(event_type)`, so
//! a `PaymentProcessed` event on a `Payment` aggregate routes as
//! `payment.payment.processed`. Binding patterns use `*` for exactly one word
//! and `#` for zero or more words.

/// Converts `PaymentProcessed` into `payment.processed`.
pub fn dot_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('.');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else if ch == '_' || ch == '-' || ch == ' ' {
            if !out.is_empty() && !out.ends_with('.') {
                out.push('.');
            }
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Routing key for an event of `event_type` emitted by `aggregate_type`.
pub fn routing_key(aggregate_type: &str, event_type: &str) -> String {
    format!("{}.{}", aggregate_type.to_lowercase(), dot_case(event_type))
}

/// Returns true if `routing_key` matches the binding `pattern`.
pub fn binding_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_case_splits_words() {
        assert_eq!(dot_case("PaymentProcessed"), "payment.processed");
        assert_eq!(dot_case("SaleStockVerified"), "sale.stock.verified");
        assert_eq!(dot_case("already.dotted"), "already.dotted");
        assert_eq!(dot_case("ORDER_FULFILLED"), "order.fulfilled");
    }

    #[test]
    fn routing_key_prefixes_aggregate() {
        assert_eq!(
            routing_key("Payment", "PaymentProcessed"),
            "payment.payment.processed"
        );
        assert_eq!(
            routing_key("Transaction", "TransactionCreated"),
            "transaction.transaction.created"
        );
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(binding_matches("payment.*.processed", "payment.payment.processed"));
        assert!(!binding_matches("payment.*", "payment.payment.processed"));
        assert!(!binding_matches("payment.*.processed", "payment.processed"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(binding_matches("#", "inventory.inventory.reserved"));
        assert!(binding_matches("payment.#", "payment.payment.failed"));
        assert!(binding_matches("payment.#", "payment"));
        assert!(binding_matches("#.failed", "payment.payment.failed"));
        assert!(!binding_matches("order.#", "payment.payment.failed"));
    }

    #[test]
    fn literal_binding_requires_exact_key() {
        assert!(binding_matches(
            "transaction.transaction.created",
            "transaction.transaction.created"
        ));
        assert!(!binding_matches(
            "transaction.transaction.created",
            "transaction.transaction.cancelled"
        ));
    }
}
