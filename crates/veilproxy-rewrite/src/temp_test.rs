#[test]
fn temp_selector_check() {
    let sel: Result<lol_html::Selector, _> = "svg *[xlink\\:href]".parse();
    assert!(sel.is_ok(), "{:?}", sel.err());
}
